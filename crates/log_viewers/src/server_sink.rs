use std::sync::Arc;

use async_trait::async_trait;
use logging::{
    Formatter,
    HistorySink,
    LogRecord,
    Sink,
    SinkOptions,
};
use netpeer::{
    Connection,
    ConnectionHandler,
    Server,
};

use crate::peers::{
    pump_lines,
    spawn_discarding_reader,
    write_replay,
    SendTimeout,
    StreamCore,
};

pub(crate) struct StreamPeerHandler {
    pub core: Arc<StreamCore>,
}

#[async_trait]
impl ConnectionHandler for StreamPeerHandler {
    async fn serve_connection(&self, connection: Arc<Connection>) {
        let (id, mut receiver, replay) = self.core.attach(&connection).await;
        if write_replay(&connection, &self.core.formatter, &replay).await {
            spawn_discarding_reader(connection.clone());
            pump_lines(&connection, &mut receiver).await;
        }
        self.core.hub.unregister(id);
    }
}

/// Streams formatted records to every connected TCP peer, optionally
/// replaying history to newly connected ones. Registering the sink starts
/// the server; removing it stops the server and drains its peers.
pub struct TcpServerSink {
    options: SinkOptions,
    core: Arc<StreamCore>,
    server: Server<StreamPeerHandler>,
}

impl TcpServerSink {
    pub fn new(port: u16, history: Option<Arc<dyn HistorySink>>) -> Self {
        Self::with_formatter(port, history, Formatter::default(), SendTimeout::FireAndForget)
    }

    pub fn with_formatter(
        port: u16,
        history: Option<Arc<dyn HistorySink>>,
        formatter: Formatter,
        send_timeout: SendTimeout,
    ) -> Self {
        let core = Arc::new(StreamCore::new(formatter, history, send_timeout));
        let server = Server::new(port, Arc::new(StreamPeerHandler { core: core.clone() }));
        Self {
            options: SinkOptions::default(),
            core,
            server,
        }
    }

    pub fn local_address(&self) -> Option<std::net::SocketAddr> {
        self.server.local_address()
    }

    pub fn peer_count(&self) -> usize {
        self.core.hub.peer_count()
    }
}

#[async_trait]
impl Sink for TcpServerSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn open(&self) -> bool {
        match self.server.start() {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("Failed to start TCP server sink: {error}");
                false
            },
        }
    }

    async fn log_record(&self, record: &LogRecord) {
        self.core.publish(record).await;
    }

    async fn close(&self) {
        self.server.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use logging::{
        Facility,
        LevelFilter,
        LogLevel,
        MemoryHistory,
    };
    use tokio::{
        io::AsyncReadExt,
        net::TcpStream,
    };

    use super::*;

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut collected = Vec::new();
        let mut buffer = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
                .await
                .expect("read timed out")
                .unwrap();
            assert_ne!(n, 0, "peer closed before {needle:?} arrived");
            collected.extend_from_slice(&buffer[..n]);
            let text = String::from_utf8_lossy(&collected).into_owned();
            if text.contains(needle) {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_streams_live_records() {
        let facility = Facility::new();
        facility.set_min_log_level(LevelFilter::Debug);
        let sink = Arc::new(TcpServerSink::with_formatter(
            0,
            None,
            Formatter::new("%m").unwrap(),
            SendTimeout::FireAndForget,
        ));
        assert!(facility.add_sink(sink.clone()).await);
        let port = sink.local_address().unwrap().port();

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Wait for the peer to be attached before logging.
        for _ in 0..100 {
            if sink.peer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        facility.log_message(None, LogLevel::Info, "over the wire");
        let text = read_until(&mut peer, "over the wire\n").await;
        assert!(text.contains("over the wire\n"));

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }

    #[tokio::test]
    async fn test_replays_history_before_live_records() {
        let facility = Facility::new();
        facility.set_min_log_level(LevelFilter::Debug);
        let history = Arc::new(MemoryHistory::new());
        let sink = Arc::new(TcpServerSink::with_formatter(
            0,
            Some(history),
            Formatter::new("%m").unwrap(),
            SendTimeout::FireAndForget,
        ));
        assert!(facility.add_sink(sink.clone()).await);
        let port = sink.local_address().unwrap().port();

        facility.log_message(None, LogLevel::Info, "old1");
        facility.log_message(None, LogLevel::Info, "old2");
        facility.drain().await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        for _ in 0..100 {
            if sink.peer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        facility.log_message(None, LogLevel::Info, "live");
        let text = read_until(&mut peer, "live\n").await;
        assert_eq!(text, "old1\nold2\nlive\n");

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }

    #[tokio::test]
    async fn test_close_stops_server() {
        let facility = Facility::new();
        let sink = Arc::new(TcpServerSink::new(0, None));
        assert!(facility.add_sink(sink.clone()).await);
        let port = sink.local_address().unwrap().port();

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
        // Wait for the scheduled close to stop the listener.
        for _ in 0..100 {
            if sink.local_address().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sink.local_address().is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
