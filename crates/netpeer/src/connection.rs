use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicU8,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use bytes::{
    Bytes,
    BytesMut,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        tcp::{
            OwnedReadHalf,
            OwnedWriteHalf,
        },
        TcpStream,
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Initialized = 0,
    Opened = 1,
    Closed = 2,
}

/// Owns one connected socket. The state machine is monotonic: a closed
/// connection is never reopened, and `close` releases the socket exactly
/// once no matter how many times it is called.
///
/// The write lock doubles as the per-connection write queue: submitted
/// writes reach the wire in lock-acquisition (FIFO) order.
pub struct Connection {
    state: AtomicU8,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: CancellationToken,
}

enum IoOutcome<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

impl Connection {
    /// Takes ownership of an already-connected socket.
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        let local_address = stream.local_addr()?;
        let remote_address = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            state: AtomicU8::new(ConnectionState::Initialized as u8),
            local_address,
            remote_address,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            0 => ConnectionState::Initialized,
            1 => ConnectionState::Opened,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.state() == ConnectionState::Opened
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Transitions Initialized -> Opened. Reads and writes require an
    /// opened connection.
    pub fn open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Initialized as u8,
                ConnectionState::Opened as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Reads at most `max_len` bytes. `None` for the timeout means block
    /// until data arrives. Returns empty bytes at EOF. Any error or an
    /// elapsed timeout closes the connection and returns `None`.
    pub async fn read_data(&self, max_len: usize, timeout: Option<Duration>) -> Option<Bytes> {
        if !self.is_opened() {
            return None;
        }
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return None;
        };
        let mut buffer = BytesMut::with_capacity(max_len.max(1));
        let outcome = Self::with_deadline(&self.closed, timeout, reader.read_buf(&mut buffer)).await;
        drop(guard);
        match outcome {
            IoOutcome::Done(Ok(_)) => Some(buffer.freeze()),
            IoOutcome::Done(Err(error)) => {
                tracing::debug!("Read failed on connection to {}: {error}", self.remote_address);
                self.close().await;
                None
            },
            IoOutcome::TimedOut | IoOutcome::Cancelled => {
                self.close().await;
                None
            },
        }
    }

    /// Writes all bytes or fails. `None` for the timeout means block until
    /// the socket accepts everything. Failure or an elapsed timeout closes
    /// the connection.
    pub async fn write_data(&self, data: Bytes, timeout: Option<Duration>) -> bool {
        if !self.is_opened() {
            return false;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        let outcome = Self::with_deadline(&self.closed, timeout, writer.write_all(&data)).await;
        drop(guard);
        match outcome {
            IoOutcome::Done(Ok(())) => true,
            IoOutcome::Done(Err(error)) => {
                tracing::debug!(
                    "Write failed on connection to {}: {error}",
                    self.remote_address
                );
                self.close().await;
                false
            },
            IoOutcome::TimedOut | IoOutcome::Cancelled => {
                self.close().await;
                false
            },
        }
    }

    /// Fire-and-forget write: scheduled on the connection's write queue
    /// without surfacing completion.
    pub fn write_data_detached(self: &Arc<Self>, data: Bytes) {
        let connection = self.clone();
        tokio::spawn(async move {
            connection.write_data(data, None).await;
        });
    }

    /// Transitions to Closed, unblocks pending reads and writes, and
    /// releases the socket. Idempotent.
    pub async fn close(&self) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous == ConnectionState::Closed as u8 {
            return;
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
        drop(writer);
        self.reader.lock().await.take();
    }

    /// Resolved when the connection reaches the Closed state.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn with_deadline<T>(
        closed: &CancellationToken,
        timeout: Option<Duration>,
        operation: impl Future<Output = T>,
    ) -> IoOutcome<T> {
        match timeout {
            Some(timeout) => {
                tokio::select! {
                    result = operation => IoOutcome::Done(result),
                    _ = tokio::time::sleep(timeout) => IoOutcome::TimedOut,
                    _ = closed.cancelled() => IoOutcome::Cancelled,
                }
            },
            None => {
                tokio::select! {
                    result = operation => IoOutcome::Done(result),
                    _ = closed.cancelled() => IoOutcome::Cancelled,
                }
            },
        }
    }
}
