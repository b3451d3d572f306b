use std::{
    fs::File,
    io::Write as _,
    sync::LazyLock,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    format::Formatter,
    record::LogRecord,
    sink::{
        Sink,
        SinkOptions,
    },
};

fn capture_descriptor(fd: i32) -> File {
    use std::os::fd::FromRawFd;

    let duplicated = unsafe { libc::dup(fd) };
    // The static handle is never dropped, so falling back to the original
    // descriptor cannot close it.
    let fd = if duplicated >= 0 { duplicated } else { fd };
    unsafe { File::from_raw_fd(fd) }
}

/// Duplicated at first use so later redirection of the process descriptors
/// does not affect the sink.
static CAPTURED_STDOUT: LazyLock<Mutex<File>> =
    LazyLock::new(|| Mutex::new(capture_descriptor(libc::STDOUT_FILENO)));
static CAPTURED_STDERR: LazyLock<Mutex<File>> =
    LazyLock::new(|| Mutex::new(capture_descriptor(libc::STDERR_FILENO)));

#[derive(Clone, Copy, Debug)]
enum StdStream {
    Stdout,
    Stderr,
}

/// Writes formatted records to a pre-captured standard stream descriptor.
pub struct StdStreamSink {
    options: SinkOptions,
    formatter: Formatter,
    stream: StdStream,
}

impl StdStreamSink {
    pub fn stdout() -> Self {
        Self {
            options: SinkOptions::default(),
            formatter: Formatter::default(),
            stream: StdStream::Stdout,
        }
    }

    pub fn stderr() -> Self {
        Self {
            options: SinkOptions::default(),
            formatter: Formatter::default(),
            stream: StdStream::Stderr,
        }
    }

    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }
}

#[async_trait]
impl Sink for StdStreamSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn log_record(&self, record: &LogRecord) {
        let formatted = match self.formatter.format(record) {
            Ok(formatted) => formatted,
            Err(error) => {
                tracing::warn!("Dropping record with unformattable content: {error}");
                return;
            },
        };
        let stream = match self.stream {
            StdStream::Stdout => &CAPTURED_STDOUT,
            StdStream::Stderr => &CAPTURED_STDERR,
        };
        if let Err(error) = stream.lock().write_all(formatted.as_bytes()) {
            tracing::warn!("Failed to write log record to standard stream: {error}");
        }
    }
}
