use std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicU8,
            Ordering,
        },
        Arc,
        LazyLock,
    },
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::{
    consts,
    format,
    level::{
        LevelFilter,
        LogLevel,
    },
    record::LogRecord,
    sink::Sink,
};

/// Tag reserved for records produced by this library about itself. Gated by
/// `min_internal_log_level` instead of `min_log_level`.
pub const INTERNAL_TAG: &str = "logging.internal";

enum SinkCommand {
    Record(Arc<LogRecord>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct RegisteredSink {
    sink: Arc<dyn Sink>,
    commands: mpsc::UnboundedSender<SinkCommand>,
}

/// The process-wide dispatcher: accepts records from any thread, gates them
/// by severity and tag, and fans each one out to every registered sink's
/// serial worker.
///
/// Tests construct their own facility; [`shared`] returns the process-wide
/// one.
pub struct Facility {
    min_log_level: AtomicU8,
    min_internal_log_level: AtomicU8,
    min_capture_callstack_level: AtomicU8,
    calls_sinks_concurrently: AtomicBool,
    sinks: Mutex<Vec<RegisteredSink>>,
}

static SHARED: LazyLock<Facility> = LazyLock::new(Facility::new);

/// The process-wide facility. Initialized on first use; honors the
/// `XLFacilityMinLogLevel` environment variable.
pub fn shared() -> &'static Facility {
    &SHARED
}

impl Default for Facility {
    fn default() -> Self {
        Self::new()
    }
}

impl Facility {
    pub fn new() -> Self {
        format::init_process_start();
        let default_min = if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        let min_log_level = std::env::var(consts::MIN_LOG_LEVEL_ENV_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<u8>().ok())
            .and_then(LevelFilter::from_value)
            .unwrap_or(default_min);
        Self {
            min_log_level: AtomicU8::new(min_log_level as u8),
            min_internal_log_level: AtomicU8::new(LevelFilter::Warning as u8),
            min_capture_callstack_level: AtomicU8::new(LevelFilter::Exception as u8),
            calls_sinks_concurrently: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn min_log_level(&self) -> LevelFilter {
        LevelFilter::from_value(self.min_log_level.load(Ordering::Relaxed))
            .expect("stored level filter is valid")
    }

    pub fn set_min_log_level(&self, filter: LevelFilter) {
        self.min_log_level.store(filter as u8, Ordering::Relaxed);
    }

    pub fn min_internal_log_level(&self) -> LevelFilter {
        LevelFilter::from_value(self.min_internal_log_level.load(Ordering::Relaxed))
            .expect("stored level filter is valid")
    }

    pub fn set_min_internal_log_level(&self, filter: LevelFilter) {
        self.min_internal_log_level.store(filter as u8, Ordering::Relaxed);
    }

    pub fn min_capture_callstack_level(&self) -> LevelFilter {
        LevelFilter::from_value(self.min_capture_callstack_level.load(Ordering::Relaxed))
            .expect("stored level filter is valid")
    }

    pub fn set_min_capture_callstack_level(&self, filter: LevelFilter) {
        self.min_capture_callstack_level
            .store(filter as u8, Ordering::Relaxed);
    }

    /// When false, the facility guarantees that across all sinks, records
    /// are enqueued in ingestion order. Enqueues are issued from the calling
    /// thread in registration order either way; the flag only widens the
    /// ordering contract the caller may rely on.
    pub fn calls_sinks_concurrently(&self) -> bool {
        self.calls_sinks_concurrently.load(Ordering::Relaxed)
    }

    pub fn set_calls_sinks_concurrently(&self, concurrent: bool) {
        self.calls_sinks_concurrently
            .store(concurrent, Ordering::Relaxed);
    }

    fn is_registered(&self, sink: &Arc<dyn Sink>) -> bool {
        self.sinks
            .lock()
            .iter()
            .any(|registered| Arc::ptr_eq(&registered.sink, sink))
    }

    /// Opens the sink on its own worker and registers it on success.
    /// Returns false if the sink is already registered or its `open` failed.
    pub async fn add_sink(&self, sink: Arc<dyn Sink>) -> bool {
        if self.is_registered(&sink) {
            return false;
        }
        let (commands, receiver) = mpsc::unbounded_channel();
        let (opened_sender, opened_receiver) = oneshot::channel();
        tokio::spawn(sink_worker(sink.clone(), receiver, opened_sender));
        if !matches!(opened_receiver.await, Ok(true)) {
            return false;
        }
        let mut sinks = self.sinks.lock();
        if sinks.iter().any(|registered| Arc::ptr_eq(&registered.sink, &sink)) {
            // Lost a race with a concurrent registration of the same sink;
            // shut the extra worker down again.
            let (ack, _) = oneshot::channel();
            let _ = commands.send(SinkCommand::Close(ack));
            return false;
        }
        sinks.push(RegisteredSink { sink, commands });
        true
    }

    /// Unregisters the sink and schedules `close` on its worker. Records
    /// already queued on the sink are still delivered before the close.
    pub fn remove_sink(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut sinks = self.sinks.lock();
        let Some(index) = sinks
            .iter()
            .position(|registered| Arc::ptr_eq(&registered.sink, sink))
        else {
            return false;
        };
        let registered = sinks.swap_remove(index);
        let (ack, _) = oneshot::channel();
        let _ = registered.commands.send(SinkCommand::Close(ack));
        true
    }

    pub fn remove_all_sinks(&self) {
        let removed = std::mem::take(&mut *self.sinks.lock());
        for registered in removed {
            let (ack, _) = oneshot::channel();
            let _ = registered.commands.send(SinkCommand::Close(ack));
        }
    }

    pub fn log_message(&self, tag: Option<&str>, level: LogLevel, message: impl Into<String>) {
        if !self.min_log_level().allows(level) {
            return;
        }
        if tag == Some(INTERNAL_TAG) && !self.min_internal_log_level().allows(level) {
            return;
        }
        let capture_callstack = self.min_capture_callstack_level().allows(level);
        let record = Arc::new(LogRecord::capture(
            tag,
            level,
            message.into(),
            capture_callstack,
        ));
        self.dispatch(record);
        if level == LogLevel::Abort {
            self.flush_blocking(consts::ABORT_FLUSH_TIMEOUT);
            std::process::abort();
        }
    }

    /// Logs an error chain at `Exception` level.
    pub fn log_exception(&self, tag: Option<&str>, error: &anyhow::Error) {
        self.log_message(tag, LogLevel::Exception, format!("{error:#}"));
    }

    /// Records produced by the library about itself.
    pub fn log_internal_message(&self, level: LogLevel, message: impl Into<String>) {
        self.log_message(Some(INTERNAL_TAG), level, message);
    }

    fn dispatch(&self, record: Arc<LogRecord>) {
        // Snapshot under the lock, send outside of it. Sends are issued in
        // registration order, which is what gives the sequential mode its
        // cross-sink ordering guarantee.
        let senders: Vec<_> = self
            .sinks
            .lock()
            .iter()
            .map(|registered| registered.commands.clone())
            .collect();
        for sender in senders {
            // A closed channel means the sink worker already shut down;
            // records for it are dropped by contract.
            let _ = sender.send(SinkCommand::Record(record.clone()));
        }
    }

    /// Waits until every record enqueued before this call has been processed
    /// by its sink.
    pub async fn drain(&self) {
        futures::future::join_all(self.send_flushes()).await;
    }

    /// Flush variant usable from non-async contexts; polls with a deadline
    /// so an abort on a starved runtime still terminates.
    fn flush_blocking(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for mut receiver in self.send_flushes() {
            loop {
                match receiver.try_recv() {
                    Ok(()) => break,
                    Err(oneshot::error::TryRecvError::Closed) => break,
                    Err(oneshot::error::TryRecvError::Empty) => {
                        if Instant::now() >= deadline {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    },
                }
            }
        }
    }

    fn send_flushes(&self) -> Vec<oneshot::Receiver<()>> {
        let sinks = self.sinks.lock();
        let mut receivers = Vec::with_capacity(sinks.len());
        for registered in sinks.iter() {
            let (ack, receiver) = oneshot::channel();
            if registered.commands.send(SinkCommand::Flush(ack)).is_ok() {
                receivers.push(receiver);
            }
        }
        receivers
    }
}

/// One worker per registered sink: the sink's serial queue. Opens the sink
/// first, then delivers commands strictly in FIFO order.
async fn sink_worker(
    sink: Arc<dyn Sink>,
    mut receiver: mpsc::UnboundedReceiver<SinkCommand>,
    opened: oneshot::Sender<bool>,
) {
    let open_result = sink.open().await;
    let _ = opened.send(open_result);
    if !open_result {
        return;
    }
    while let Some(command) = receiver.recv().await {
        match command {
            SinkCommand::Record(record) => {
                if sink.options().should_log(&record) {
                    sink.log_record(&record).await;
                }
            },
            SinkCommand::Flush(ack) => {
                let _ = ack.send(());
            },
            SinkCommand::Close(ack) => {
                sink.close().await;
                let _ = ack.send(());
                return;
            },
        }
    }
    // All senders dropped without an explicit close: the facility itself
    // went away.
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::sink::SinkOptions;

    #[derive(Default)]
    struct TestSink {
        options: SinkOptions,
        received: Mutex<Vec<LogRecord>>,
        opens: AtomicUsize,
        closes: AtomicUsize,
        refuse_open: bool,
    }

    impl TestSink {
        fn refusing() -> Self {
            Self {
                refuse_open: true,
                ..Self::default()
            }
        }

        fn messages(&self) -> Vec<String> {
            self.received
                .lock()
                .iter()
                .map(|record| record.message.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for TestSink {
        fn options(&self) -> &SinkOptions {
            &self.options
        }

        async fn open(&self) -> bool {
            self.opens.fetch_add(1, Ordering::SeqCst);
            !self.refuse_open
        }

        async fn log_record(&self, record: &LogRecord) {
            self.received.lock().push(record.clone());
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_facility() -> Facility {
        let facility = Facility::new();
        facility.set_min_log_level(LevelFilter::Debug);
        facility
    }

    #[tokio::test]
    async fn test_fan_out_in_ingestion_order() {
        let facility = test_facility();
        let a = Arc::new(TestSink::default());
        let b = Arc::new(TestSink::default());
        assert!(facility.add_sink(a.clone()).await);
        assert!(facility.add_sink(b.clone()).await);

        facility.log_message(None, LogLevel::Info, "r1");
        facility.log_message(None, LogLevel::Info, "r2");
        facility.log_message(None, LogLevel::Info, "r3");
        facility.drain().await;

        assert_eq!(a.messages(), vec!["r1", "r2", "r3"]);
        assert_eq!(b.messages(), vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_level_gating() {
        let facility = test_facility();
        facility.set_min_log_level(LevelFilter::Warning);
        let sink = Arc::new(TestSink::default());
        assert!(facility.add_sink(sink.clone()).await);

        facility.log_message(None, LogLevel::Debug, "dropped");
        facility.log_message(None, LogLevel::Warning, "kept1");
        facility.log_message(None, LogLevel::Error, "kept2");
        facility.drain().await;

        assert_eq!(sink.messages(), vec!["kept1", "kept2"]);
    }

    #[tokio::test]
    async fn test_per_sink_gating() {
        let facility = test_facility();
        let sink = Arc::new(TestSink::default());
        sink.options.set_min_log_level(LevelFilter::Error);
        assert!(facility.add_sink(sink.clone()).await);

        facility.log_message(None, LogLevel::Info, "dropped");
        facility.log_message(None, LogLevel::Error, "kept");
        facility.drain().await;

        assert_eq!(sink.messages(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_add_remove_add() {
        let facility = test_facility();
        let sink = Arc::new(TestSink::default());
        let as_dyn: Arc<dyn Sink> = sink.clone();

        assert!(facility.add_sink(as_dyn.clone()).await);
        assert!(!facility.add_sink(as_dyn.clone()).await);
        assert!(facility.remove_sink(&as_dyn));
        assert!(!facility.remove_sink(&as_dyn));
        // Wait for the scheduled close to land on the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(facility.add_sink(as_dyn.clone()).await);

        assert_eq!(sink.opens.load(Ordering::SeqCst), 2);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_open_rejects_sink() {
        let facility = test_facility();
        let sink = Arc::new(TestSink::refusing());
        assert!(!facility.add_sink(sink.clone()).await);

        facility.log_message(None, LogLevel::Info, "r1");
        facility.drain().await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_records_after_remove_are_dropped() {
        let facility = test_facility();
        let sink = Arc::new(TestSink::default());
        let as_dyn: Arc<dyn Sink> = sink.clone();
        assert!(facility.add_sink(as_dyn.clone()).await);

        facility.log_message(None, LogLevel::Info, "before");
        facility.remove_sink(&as_dyn);
        facility.log_message(None, LogLevel::Info, "after");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.messages(), vec!["before"]);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_internal_tag_gating() {
        let facility = test_facility();
        facility.set_min_internal_log_level(LevelFilter::Warning);
        let sink = Arc::new(TestSink::default());
        assert!(facility.add_sink(sink.clone()).await);

        facility.log_internal_message(LogLevel::Info, "chatter");
        facility.log_internal_message(LogLevel::Warning, "problem");
        facility.drain().await;

        assert_eq!(sink.messages(), vec!["problem"]);
    }

    #[tokio::test]
    async fn test_callstack_capture_gate() {
        let facility = test_facility();
        facility.set_min_capture_callstack_level(LevelFilter::Error);
        let sink = Arc::new(TestSink::default());
        assert!(facility.add_sink(sink.clone()).await);

        facility.log_message(None, LogLevel::Info, "plain");
        facility.log_message(None, LogLevel::Error, "with stack");
        facility.drain().await;

        let received = sink.received.lock();
        assert_eq!(received.len(), 2);
        assert!(received[0].callstack.is_none());
        assert!(received[1].callstack.is_some());
    }

    #[tokio::test]
    async fn test_remove_all_sinks() {
        let facility = test_facility();
        let a = Arc::new(TestSink::default());
        let b = Arc::new(TestSink::default());
        assert!(facility.add_sink(a.clone()).await);
        assert!(facility.add_sink(b.clone()).await);

        facility.remove_all_sinks();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }
}
