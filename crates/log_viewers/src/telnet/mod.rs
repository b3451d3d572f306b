pub mod protocol;
pub mod session;
pub mod sink;

pub use session::{
    parse_command_line,
    TelnetSession,
};
pub use sink::{
    CommandHandler,
    LineHandler,
    StartHandler,
    TelnetConfig,
    TelnetServerSink,
};
