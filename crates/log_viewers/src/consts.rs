use std::time::Duration;

// Peer streaming
pub const READ_CHUNK_SIZE: usize = 1024;

// Telnet sink
pub const DEFAULT_TELNET_PORT: u16 = 2323;
pub const DEFAULT_PROMPT: &str = "> ";
pub const DEFAULT_TAB_PLACEHOLDER: &str = "\t";
/// Bytes tolerated in a command or escape sequence before the session is
/// treated as malformed and closed.
pub const MAX_PENDING_TELNET_BYTES: usize = 256;

// HTTP sink
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const MAX_HTTP_REQUEST_BYTES: usize = 8192;
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
