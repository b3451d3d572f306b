use std::time::Duration;

// Facility
pub const MIN_LOG_LEVEL_ENV_VAR: &str = "XLFacilityMinLogLevel";
pub const ABORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// Formatter
pub const DEFAULT_FORMAT: &str = "%t [%L]> %m%c";
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
pub const DEFAULT_TAG_PLACEHOLDER: &str = "(none)";
pub const DEFAULT_QUEUE_LABEL_PLACEHOLDER: &str = "(none)";
pub const DEFAULT_CALLSTACK_HEADER: &str = "\n\n>>> Captured call stack:\n";
