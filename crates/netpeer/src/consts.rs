use std::time::Duration;

// Server
pub const LISTEN_BACKLOG: i32 = 16;

// Client
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(300);
