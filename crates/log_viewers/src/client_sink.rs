use std::sync::Arc;

use async_trait::async_trait;
use logging::{
    Formatter,
    HistorySink,
    LogRecord,
    Sink,
    SinkOptions,
};
use netpeer::Client;

use crate::{
    peers::{
        SendTimeout,
        StreamCore,
    },
    server_sink::StreamPeerHandler,
};

/// Connects out to a log-collecting TCP server and streams formatted
/// records to it, replaying history on every (re)connect when a history
/// sink is attached. While disconnected, records are preserved only through
/// the history sink; without one they are dropped until the next connect.
pub struct TcpClientSink {
    options: SinkOptions,
    core: Arc<StreamCore>,
    client: Client<StreamPeerHandler>,
    automatically_reconnects: bool,
}

impl TcpClientSink {
    pub fn new(host: impl Into<String>, port: u16, history: Option<Arc<dyn HistorySink>>) -> Self {
        Self::with_formatter(
            host,
            port,
            history,
            Formatter::default(),
            SendTimeout::FireAndForget,
            true,
        )
    }

    pub fn with_formatter(
        host: impl Into<String>,
        port: u16,
        history: Option<Arc<dyn HistorySink>>,
        formatter: Formatter,
        send_timeout: SendTimeout,
        automatically_reconnects: bool,
    ) -> Self {
        let core = Arc::new(StreamCore::new(formatter, history, send_timeout));
        let client = Client::new(host, port, Arc::new(StreamPeerHandler { core: core.clone() }))
            .with_automatic_reconnect(automatically_reconnects);
        Self {
            options: SinkOptions::default(),
            core,
            client,
            automatically_reconnects,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.hub.peer_count() > 0
    }
}

#[async_trait]
impl Sink for TcpClientSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    /// With automatic reconnection enabled, an unreachable server does not
    /// reject the sink; the client keeps retrying in the background.
    async fn open(&self) -> bool {
        match self.client.start().await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("TCP client sink failed to connect: {error}");
                self.automatically_reconnects
            },
        }
    }

    async fn log_record(&self, record: &LogRecord) {
        self.core.publish(record).await;
    }

    async fn close(&self) {
        self.client.stop().await;
    }
}
