use std::{
    backtrace::Backtrace,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::level::LogLevel;

/// An immutable log event. Every field reflects the state of the producer
/// thread at the instant the record was constructed, not the instant a sink
/// processes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    /// Seconds since the Unix epoch.
    pub absolute_time: f64,
    /// Optional short namespacing tag.
    pub tag: Option<String>,
    pub level: LogLevel,
    /// Already-interpolated message text.
    pub message: String,
    /// Snapshot of the calling thread's errno.
    pub captured_errno: i32,
    /// OS thread identifier of the producer.
    pub captured_thread_id: u64,
    /// Name of the producing thread, when it has one.
    pub captured_queue_label: Option<String>,
    /// Frame descriptions, present only when the facility was configured to
    /// capture callstacks at this record's level.
    pub callstack: Option<Vec<String>>,
}

impl LogRecord {
    pub fn capture(
        tag: Option<&str>,
        level: LogLevel,
        message: String,
        with_callstack: bool,
    ) -> Self {
        let callstack = with_callstack.then(current_callstack);
        Self {
            absolute_time: unix_time_now(),
            tag: tag.map(String::from),
            level,
            message,
            captured_errno: last_errno(),
            captured_thread_id: current_thread_id(),
            captured_queue_label: std::thread::current().name().map(String::from),
            callstack,
        }
    }
}

pub fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    (unsafe { libc::gettid() }) as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
fn current_thread_id() -> u64 {
    0
}

fn current_callstack() -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(String::from)
        .collect()
}
