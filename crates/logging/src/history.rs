use async_trait::async_trait;
use parking_lot::Mutex;

use crate::record::LogRecord;

/// Persistent record store used by the remote-viewer sinks for history
/// replay. The SQLite-backed implementation lives outside this workspace;
/// [`MemoryHistory`] covers the common in-process case.
#[async_trait]
pub trait HistorySink: Send + Sync + 'static {
    async fn append_record(&self, record: &LogRecord) -> anyhow::Result<()>;

    /// Deletes records older than `time` (seconds since epoch). Pass `0.0`
    /// to delete everything.
    async fn purge_records_before(&self, time: f64) -> anyhow::Result<()>;

    /// Returns records strictly newer than `time`, oldest first. Pass `0.0`
    /// for the full history.
    async fn records_after(&self, time: f64) -> anyhow::Result<Vec<LogRecord>>;
}

/// Unbounded in-memory history, ordered by append time.
#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn append_record(&self, record: &LogRecord) -> anyhow::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn purge_records_before(&self, time: f64) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        if time == 0.0 {
            records.clear();
        } else {
            records.retain(|record| record.absolute_time >= time);
        }
        Ok(())
    }

    async fn records_after(&self, time: f64) -> anyhow::Result<Vec<LogRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| record.absolute_time > time)
            .cloned()
            .collect())
    }
}
