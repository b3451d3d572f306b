use std::sync::atomic::{
    AtomicU8,
    Ordering,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    level::{
        LevelFilter,
        LogLevel,
    },
    record::LogRecord,
};

pub type RecordFilter = Box<dyn Fn(&LogRecord) -> bool + Send + Sync>;

/// Per-sink gating configuration shared by every sink implementation:
/// min/max severity plus an optional predicate. Evaluated on the sink's
/// worker before `log_record` is invoked.
pub struct SinkOptions {
    min_log_level: AtomicU8,
    max_log_level: AtomicU8,
    filter: Mutex<Option<RecordFilter>>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            min_log_level: AtomicU8::new(LevelFilter::Debug as u8),
            max_log_level: AtomicU8::new(LogLevel::Abort as u8),
            filter: Mutex::new(None),
        }
    }
}

impl SinkOptions {
    pub fn min_log_level(&self) -> LevelFilter {
        LevelFilter::from_value(self.min_log_level.load(Ordering::Relaxed))
            .expect("stored level filter is valid")
    }

    pub fn set_min_log_level(&self, filter: LevelFilter) {
        self.min_log_level.store(filter as u8, Ordering::Relaxed);
    }

    pub fn max_log_level(&self) -> LogLevel {
        LogLevel::from_value(self.max_log_level.load(Ordering::Relaxed))
            .expect("stored level is valid")
    }

    pub fn set_max_log_level(&self, level: LogLevel) {
        self.max_log_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn set_filter(&self, filter: Option<RecordFilter>) {
        *self.filter.lock() = filter;
    }

    pub fn should_log(&self, record: &LogRecord) -> bool {
        if !self.min_log_level().allows(record.level) || record.level > self.max_log_level() {
            return false;
        }
        match &*self.filter.lock() {
            Some(filter) => filter(record),
            None => true,
        }
    }
}

/// A consumer of log records. Implementations receive every call on their
/// own serial worker, so `log_record` invocations never overlap for one
/// sink instance.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    fn options(&self) -> &SinkOptions;

    /// Called once when the sink is registered with a facility. Returning
    /// false rejects the registration.
    async fn open(&self) -> bool {
        true
    }

    async fn log_record(&self, record: &LogRecord);

    /// Called once when the sink is removed or the facility shuts down.
    async fn close(&self) {}
}
