use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

/// Severity of a log record, totally ordered from `Debug` up to `Abort`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Exception = 5,
    Abort = 6,
}

impl LogLevel {
    pub const MAX: LogLevel = LogLevel::Abort;
    pub const MIN: LogLevel = LogLevel::Debug;

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Debug),
            1 => Some(Self::Verbose),
            2 => Some(Self::Info),
            3 => Some(Self::Warning),
            4 => Some(Self::Error),
            5 => Some(Self::Exception),
            6 => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Exception => "exception",
            Self::Abort => "abort",
        }
    }

    /// Uppercase name padded with trailing spaces to a constant width so
    /// columns line up in formatted output.
    pub fn padded_name(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG    ",
            Self::Verbose => "VERBOSE  ",
            Self::Info => "INFO     ",
            Self::Warning => "WARNING  ",
            Self::Error => "ERROR    ",
            Self::Exception => "EXCEPTION",
            Self::Abort => "ABORT    ",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "verbose" => Self::Verbose,
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "exception" => Self::Exception,
            "abort" => Self::Abort,
            _ => anyhow::bail!("unknown log level {s:?}"),
        };
        Ok(parsed)
    }
}

/// A minimum-severity gate. `Mute` sits above every level and disables the
/// gate entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LevelFilter {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Exception = 5,
    Abort = 6,
    Mute = 7,
}

impl LevelFilter {
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Debug),
            1 => Some(Self::Verbose),
            2 => Some(Self::Info),
            3 => Some(Self::Warning),
            4 => Some(Self::Error),
            5 => Some(Self::Exception),
            6 => Some(Self::Abort),
            7 => Some(Self::Mute),
            _ => None,
        }
    }

    pub fn allows(self, level: LogLevel) -> bool {
        level as u8 >= self as u8
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        // The discriminants line up by construction.
        Self::from_value(level as u8).expect("LogLevel out of LevelFilter range")
    }
}
