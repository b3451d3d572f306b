use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    connection::Connection,
    consts,
    server::ConnectionHandler,
};

struct ClientState {
    running: bool,
    shutdown: CancellationToken,
    connection: Option<Arc<Connection>>,
    driver: Option<JoinHandle<()>>,
}

/// Maintains at most one outgoing connection at a time, reconnecting with
/// exponential backoff when enabled. The first connect failure is surfaced
/// from `start`; later failures are logged and retried.
pub struct Client<H: ConnectionHandler> {
    host: String,
    port: u16,
    handler: Arc<H>,
    connection_timeout: Duration,
    automatically_reconnects: bool,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
    state: Arc<Mutex<ClientState>>,
}

impl<H: ConnectionHandler> Client<H> {
    pub fn new(host: impl Into<String>, port: u16, handler: Arc<H>) -> Self {
        Self {
            host: host.into(),
            port,
            handler,
            connection_timeout: consts::DEFAULT_CONNECTION_TIMEOUT,
            automatically_reconnects: true,
            min_reconnect_interval: consts::DEFAULT_MIN_RECONNECT_INTERVAL,
            max_reconnect_interval: consts::DEFAULT_MAX_RECONNECT_INTERVAL,
            state: Arc::new(Mutex::new(ClientState {
                running: false,
                shutdown: CancellationToken::new(),
                connection: None,
                driver: None,
            })),
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_automatic_reconnect(mut self, reconnect: bool) -> Self {
        self.automatically_reconnects = reconnect;
        self
    }

    pub fn with_reconnect_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_interval = min;
        self.max_reconnect_interval = max;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().connection.clone()
    }

    /// Attempts the first connect inline. With automatic reconnection
    /// enabled the client keeps retrying in the background even when this
    /// first attempt fails.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown = {
            let mut state = self.state.lock();
            if state.running {
                anyhow::bail!("client is already running");
            }
            state.running = true;
            state.shutdown = CancellationToken::new();
            state.shutdown.clone()
        };
        let first_attempt = self.connect_once().await;
        let initial = match &first_attempt {
            Ok(connection) => Some(connection.clone()),
            Err(_) => None,
        };
        if initial.is_some() || self.automatically_reconnects {
            let driver = tokio::spawn(drive(
                self.handler.clone(),
                self.state.clone(),
                ConnectSettings {
                    host: self.host.clone(),
                    port: self.port,
                    connection_timeout: self.connection_timeout,
                    automatically_reconnects: self.automatically_reconnects,
                    min_reconnect_interval: self.min_reconnect_interval,
                    max_reconnect_interval: self.max_reconnect_interval,
                },
                shutdown,
                initial,
            ));
            self.state.lock().driver = Some(driver);
        } else {
            self.state.lock().running = false;
        }
        first_attempt.map(|_| ())
    }

    /// Cancels any pending reconnect and closes the current connection.
    pub async fn stop(&self) {
        let (shutdown, connection, driver) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (
                state.shutdown.clone(),
                state.connection.take(),
                state.driver.take(),
            )
        };
        shutdown.cancel();
        if let Some(connection) = connection {
            connection.close().await;
        }
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    async fn connect_once(&self) -> anyhow::Result<Arc<Connection>> {
        connect(
            &self.host,
            self.port,
            self.connection_timeout,
        )
        .await
    }
}

struct ConnectSettings {
    host: String,
    port: u16,
    connection_timeout: Duration,
    automatically_reconnects: bool,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

async fn connect(host: &str, port: u16, limit: Duration) -> anyhow::Result<Arc<Connection>> {
    let address = format!("{host}:{port}");
    let stream = timeout(limit, TcpStream::connect(&address))
        .await
        .with_context(|| format!("timed out connecting to {address}"))?
        .with_context(|| format!("failed to connect to {address}"))?;
    Ok(Arc::new(Connection::new(stream)?))
}

/// The client's serial control task: serves one connection at a time and
/// sleeps out the backoff between attempts.
async fn drive<H: ConnectionHandler>(
    handler: Arc<H>,
    state: Arc<Mutex<ClientState>>,
    settings: ConnectSettings,
    shutdown: CancellationToken,
    mut next: Option<Arc<Connection>>,
) {
    let mut backoff = Backoff::new(
        settings.min_reconnect_interval,
        settings.max_reconnect_interval,
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let connection = match next.take() {
            Some(connection) => connection,
            None => {
                let delay = backoff.fail();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown.cancelled() => break,
                }
                match connect(&settings.host, settings.port, settings.connection_timeout).await {
                    Ok(connection) => connection,
                    Err(error) => {
                        tracing::warn!(
                            "Failed to connect to {}:{}: {error}",
                            settings.host,
                            settings.port
                        );
                        continue;
                    },
                }
            },
        };
        backoff.reset();
        state.lock().connection = Some(connection.clone());
        handler.will_open_connection(&connection).await;
        if connection.open() {
            handler.serve_connection(connection.clone()).await;
        }
        connection.close().await;
        state.lock().connection = None;
        handler.did_close_connection(&connection).await;
        if !settings.automatically_reconnects {
            break;
        }
    }
    state.lock().running = false;
}
