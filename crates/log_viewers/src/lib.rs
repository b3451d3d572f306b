//! Remote log viewers: sinks that stream formatted records to TCP peers.
//!
//! The Telnet sink is the interactive one: each connected terminal gets a
//! line-edited prompt with history, and live log output is interleaved with
//! the prompt without clobbering the edit in progress. The HTTP sink serves
//! a long-polling browser view; the plain TCP server and client sinks move
//! formatted text to whoever is listening.

pub mod client_sink;
pub mod consts;
pub mod http_sink;
pub mod peers;
pub mod server_sink;
pub mod telnet;

pub use client_sink::TcpClientSink;
pub use http_sink::HttpServerSink;
pub use peers::SendTimeout;
pub use server_sink::TcpServerSink;
pub use telnet::{
    TelnetConfig,
    TelnetServerSink,
};
