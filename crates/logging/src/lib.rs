//! Structured logging with pluggable sinks.
//!
//! Records flow from producers into a [`Facility`], which gates them by
//! severity and tag and fans each one out to every registered [`Sink`] on
//! that sink's own serial worker. Sinks format records to text with a
//! printf-style [`Formatter`].

pub mod consts;
pub mod facility;
pub mod format;
pub mod history;
pub mod level;
pub mod record;
pub mod sink;
pub mod sinks;

pub use facility::{
    shared,
    Facility,
    INTERNAL_TAG,
};
pub use format::{
    Formatter,
    TemplateError,
};
pub use history::{
    HistorySink,
    MemoryHistory,
};
pub use level::{
    LevelFilter,
    LogLevel,
};
pub use record::LogRecord;
pub use sink::{
    RecordFilter,
    Sink,
    SinkOptions,
};
