//! Reusable TCP peer framework: a dual-stack listening server and an
//! auto-reconnecting client, each producing per-connection objects with
//! timed byte I/O and strict per-connection write ordering.

pub mod backoff;
pub mod client;
pub mod connection;
pub mod consts;
pub mod server;

pub use backoff::Backoff;
pub use client::Client;
pub use connection::{
    Connection,
    ConnectionState,
};
pub use server::{
    ConnectionHandler,
    Server,
};
