use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use logging::{
    Formatter,
    HistorySink,
    LogLevel,
    LogRecord,
};
use netpeer::Connection;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    oneshot,
};

/// How long fan-out may block the sink's worker per peer.
#[derive(Clone, Copy, Debug)]
pub enum SendTimeout {
    /// Enqueue and move on without observing completion.
    FireAndForget,
    /// Wait until the peer's write completes.
    Block,
    /// Wait up to the given duration, then close the peer.
    Within(Duration),
}

/// One formatted record on its way to a peer. The acknowledgment is sent by
/// the peer task once the bytes have been handed to the socket.
pub struct OutboundRecord {
    pub line: Arc<str>,
    pub level: LogLevel,
    pub ack: Option<oneshot::Sender<()>>,
}

struct PeerSlot {
    sender: mpsc::UnboundedSender<OutboundRecord>,
    connection: Arc<Connection>,
}

/// Registry of connected peers for one sink. Each peer owns an unbounded
/// FIFO channel; the channel plus the peer's task form its serial queue, so
/// per-peer delivery order matches fan-out order.
#[derive(Default)]
pub struct PeerHub {
    peers: Mutex<HashMap<u64, PeerSlot>>,
    next_id: AtomicU64,
}

impl PeerHub {
    pub fn register(
        &self,
        connection: Arc<Connection>,
    ) -> (u64, mpsc::UnboundedReceiver<OutboundRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(
            id,
            PeerSlot {
                sender,
                connection,
            },
        );
        (id, receiver)
    }

    pub fn unregister(&self, id: u64) {
        self.peers.lock().remove(&id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Delivers one formatted record to every registered peer, honoring the
    /// sink's send-timeout policy.
    pub async fn fan_out(&self, line: Arc<str>, level: LogLevel, timeout: SendTimeout) {
        let slots: Vec<(mpsc::UnboundedSender<OutboundRecord>, Arc<Connection>)> = self
            .peers
            .lock()
            .values()
            .map(|slot| (slot.sender.clone(), slot.connection.clone()))
            .collect();
        match timeout {
            SendTimeout::FireAndForget => {
                for (sender, _) in slots {
                    let _ = sender.send(OutboundRecord {
                        line: line.clone(),
                        level,
                        ack: None,
                    });
                }
            },
            SendTimeout::Block => {
                for (sender, _) in slots {
                    let (ack, done) = oneshot::channel();
                    if sender
                        .send(OutboundRecord {
                            line: line.clone(),
                            level,
                            ack: Some(ack),
                        })
                        .is_ok()
                    {
                        let _ = done.await;
                    }
                }
            },
            SendTimeout::Within(limit) => {
                for (sender, connection) in slots {
                    let (ack, done) = oneshot::channel();
                    if sender
                        .send(OutboundRecord {
                            line: line.clone(),
                            level,
                            ack: Some(ack),
                        })
                        .is_err()
                    {
                        continue;
                    }
                    if tokio::time::timeout(limit, done).await.is_err() {
                        tracing::warn!(
                            "Disconnecting unresponsive peer {}",
                            connection.remote_address()
                        );
                        connection.close().await;
                    }
                }
            },
        }
    }
}

/// Shared state behind every peer-streaming sink: the peer registry, the
/// sink's formatter, and the optional history store. `stream_lock` makes
/// "append record + fan out" atomic with respect to a new peer's
/// "snapshot history + register", which keeps replay and live streaming in
/// monotonic timestamp order without duplicates.
pub struct StreamCore {
    pub hub: PeerHub,
    pub formatter: Formatter,
    pub history: Option<Arc<dyn HistorySink>>,
    pub send_timeout: SendTimeout,
    stream_lock: tokio::sync::Mutex<()>,
}

impl StreamCore {
    pub fn new(
        formatter: Formatter,
        history: Option<Arc<dyn HistorySink>>,
        send_timeout: SendTimeout,
    ) -> Self {
        Self {
            hub: PeerHub::default(),
            formatter,
            history,
            send_timeout,
            stream_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Formats and publishes one record: appended to history (when
    /// attached), then fanned out to every connected peer.
    pub async fn publish(&self, record: &LogRecord) {
        let line = match self.formatter.format(record) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!("Dropping record with unformattable content: {error}");
                return;
            },
        };
        let line: Arc<str> = line.into();
        let _guard = self.stream_lock.lock().await;
        if let Some(history) = &self.history {
            if let Err(error) = history.append_record(record).await {
                tracing::warn!("Failed to append record to history: {error}");
            }
        }
        self.hub.fan_out(line, record.level, self.send_timeout).await;
    }

    /// Registers a new peer and returns the history records it must replay
    /// before pumping live output. Runs under the stream lock so no record
    /// is both replayed and queued.
    pub async fn attach(
        &self,
        connection: &Arc<Connection>,
    ) -> (u64, mpsc::UnboundedReceiver<OutboundRecord>, Vec<LogRecord>) {
        let _guard = self.stream_lock.lock().await;
        let replay = match &self.history {
            Some(history) => match history.records_after(0.0).await {
                Ok(records) => records,
                Err(error) => {
                    tracing::warn!("Failed to load history for replay: {error}");
                    Vec::new()
                },
            },
            None => Vec::new(),
        };
        let (id, receiver) = self.hub.register(connection.clone());
        (id, receiver, replay)
    }
}

/// Streams queued records to one peer as plain text until the peer channel
/// or the connection goes away. Acknowledges each record after the write.
pub async fn pump_lines(
    connection: &Arc<Connection>,
    receiver: &mut mpsc::UnboundedReceiver<OutboundRecord>,
) {
    while let Some(outbound) = receiver.recv().await {
        let written = connection
            .write_data(bytes::Bytes::copy_from_slice(outbound.line.as_bytes()), None)
            .await;
        if let Some(ack) = outbound.ack {
            let _ = ack.send(());
        }
        if !written {
            break;
        }
    }
}

/// Writes the history snapshot to a freshly attached peer. Returns false if
/// the peer went away mid-replay.
pub async fn write_replay(
    connection: &Arc<Connection>,
    formatter: &Formatter,
    records: &[LogRecord],
) -> bool {
    for record in records {
        let line = match formatter.format(record) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!("Skipping unformattable history record: {error}");
                continue;
            },
        };
        if !connection
            .write_data(bytes::Bytes::from(line.into_bytes()), None)
            .await
        {
            return false;
        }
    }
    true
}

/// Reads and discards inbound bytes so remote hangup is noticed promptly;
/// closes the connection at EOF.
pub fn spawn_discarding_reader(connection: Arc<Connection>) {
    tokio::spawn(async move {
        loop {
            match connection
                .read_data(crate::consts::READ_CHUNK_SIZE, None)
                .await
            {
                None => break,
                Some(data) if data.is_empty() => break,
                Some(_) => {},
            }
        }
        connection.close().await;
    });
}
