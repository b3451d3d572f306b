use std::{
    fs::{
        File,
        OpenOptions,
    },
    io::Write as _,
    path::PathBuf,
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

enum Target {
    Path { path: PathBuf, append: bool },
    Adopted(Mutex<Option<File>>),
}

/// Writes each formatted record to a file with a single unbuffered write.
/// The file is opened when the sink is registered, not at construction.
pub struct FileSink {
    options: SinkOptions,
    formatter: Formatter,
    target: Target,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, append: bool) -> Self {
        Self {
            options: SinkOptions::default(),
            formatter: Formatter::default(),
            target: Target::Path {
                path: path.into(),
                append,
            },
            file: Mutex::new(None),
        }
    }

    /// Adopts an already-open file; the sink takes ownership and closes it
    /// with `close`.
    pub fn from_file(file: File) -> Self {
        Self {
            options: SinkOptions::default(),
            formatter: Formatter::default(),
            target: Target::Adopted(Mutex::new(Some(file))),
            file: Mutex::new(None),
        }
    }

    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }
}

#[async_trait]
impl Sink for FileSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn open(&self) -> bool {
        let opened = match &self.target {
            Target::Path { path, append } => {
                let result = OpenOptions::new()
                    .create(true)
                    .append(*append)
                    .write(true)
                    .truncate(!append)
                    .open(path);
                match result {
                    Ok(file) => Some(file),
                    Err(error) => {
                        tracing::warn!("Failed to open log file {path:?}: {error}");
                        None
                    },
                }
            },
            Target::Adopted(file) => file.lock().take(),
        };
        let Some(opened) = opened else {
            return false;
        };
        *self.file.lock() = Some(opened);
        true
    }

    async fn log_record(&self, record: &LogRecord) {
        let formatted = match self.formatter.format(record) {
            Ok(formatted) => formatted,
            Err(error) => {
                tracing::warn!("Dropping record with unformattable content: {error}");
                return;
            },
        };
        let mut file = self.file.lock();
        if let Some(file) = file.as_mut() {
            if let Err(error) = file.write_all(formatted.as_bytes()) {
                tracing::warn!("Failed to write log record: {error}");
            }
        }
    }

    async fn close(&self) {
        // Dropping the handle closes the descriptor.
        self.file.lock().take();
    }
}
