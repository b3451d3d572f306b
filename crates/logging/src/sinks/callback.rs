use async_trait::async_trait;

use crate::{
    record::LogRecord,
    sink::{
        Sink,
        SinkOptions,
    },
};

pub type OpenCallback = Box<dyn Fn() -> bool + Send + Sync>;
pub type RecordCallback = Box<dyn Fn(&LogRecord) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;

/// Invokes user-supplied callbacks on the sink's worker. Callbacks must be
/// reentrant across multiple sink instances.
pub struct CallbackSink {
    options: SinkOptions,
    open_callback: Option<OpenCallback>,
    record_callback: RecordCallback,
    close_callback: Option<CloseCallback>,
}

impl CallbackSink {
    pub fn new(record_callback: impl Fn(&LogRecord) + Send + Sync + 'static) -> Self {
        Self {
            options: SinkOptions::default(),
            open_callback: None,
            record_callback: Box::new(record_callback),
            close_callback: None,
        }
    }

    pub fn with_open_callback(
        mut self,
        callback: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.open_callback = Some(Box::new(callback));
        self
    }

    pub fn with_close_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.close_callback = Some(Box::new(callback));
        self
    }
}

#[async_trait]
impl Sink for CallbackSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn open(&self) -> bool {
        match &self.open_callback {
            Some(callback) => callback(),
            None => true,
        }
    }

    async fn log_record(&self, record: &LogRecord) {
        (self.record_callback)(record);
    }

    async fn close(&self) {
        if let Some(callback) = &self.close_callback {
            callback();
        }
    }
}
