use std::{
    collections::HashMap,
    net::{
        Ipv4Addr,
        Ipv6Addr,
        SocketAddr,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{
    Domain,
    Protocol,
    Socket,
    Type,
};
use tokio::{
    net::TcpListener,
    sync::Notify,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    consts,
};

/// Per-connection behavior for a [`Server`] or
/// [`Client`](crate::client::Client). `serve_connection` is the
/// connection's serial task: it owns all reads and decides when the session
/// ends.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called after accept, before the connection is opened.
    async fn will_open_connection(&self, _connection: &Arc<Connection>) {}

    /// Drives the connection until the session is over. The connection is
    /// closed when this returns.
    async fn serve_connection(&self, connection: Arc<Connection>);

    /// Called after the connection has fully closed.
    async fn did_close_connection(&self, _connection: &Arc<Connection>) {}
}

struct LiveConnections {
    map: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl LiveConnections {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    fn register(&self, connection: Arc<Connection>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.lock().insert(id, connection);
        id
    }

    fn unregister(&self, id: u64) {
        self.map.lock().remove(&id);
        self.drained.notify_waiters();
    }
}

struct RunningServer {
    local_address: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Listens for TCP peers on IPv4 and IPv6 and runs one handler task per
/// accepted connection. `stop` blocks until every live connection has
/// drained.
pub struct Server<H: ConnectionHandler> {
    port: u16,
    handler: Arc<H>,
    connections: Arc<LiveConnections>,
    running: Mutex<Option<RunningServer>>,
}

impl<H: ConnectionHandler> Server<H> {
    /// Port 0 requests an ephemeral port; see [`Server::local_address`].
    pub fn new(port: u16, handler: Arc<H>) -> Self {
        Self {
            port,
            handler,
            connections: Arc::new(LiveConnections::new()),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_address)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.map.lock().values().cloned().collect()
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            anyhow::bail!("server is already running");
        }
        let listener = bind_listener(self.port)?;
        let local_address = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.connections.clone(),
            shutdown.clone(),
        ));
        *running = Some(RunningServer {
            local_address,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    /// Closes the listening socket, then closes every live connection and
    /// waits until all of them have finished closing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.cancel();
        let _ = running.accept_task.await;
        // Connections can still be registering while the accept task winds
        // down, so re-close whatever is live on every round.
        loop {
            let drained = self.connections.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let live = self.connections();
            if live.is_empty() {
                break;
            }
            for connection in live {
                connection.close().await;
            }
            drained.await;
        }
    }
}

/// Binds a dual-stack listener (`IPV6_V6ONLY=0`) so IPv4 clients are served
/// through v4-mapped addresses; falls back to plain IPv4 where dual-stack
/// is unavailable.
fn bind_listener(port: u16) -> anyhow::Result<TcpListener> {
    let std_listener = match bind_dual_stack(port) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::warn!("Dual-stack bind failed, falling back to IPv4: {error}");
            bind_v4(port)?
        },
    };
    Ok(TcpListener::from_std(std_listener)?)
}

fn bind_dual_stack(port: u16) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    let address = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    socket.listen(consts::LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_v4(port: u16) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    socket.listen(consts::LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn accept_loop<H: ConnectionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    connections: Arc<LiveConnections>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(error) => {
                // Transient accept failures keep the loop alive.
                tracing::warn!("Failed to accept connection: {error}");
                continue;
            },
        };
        let connection = match Connection::new(stream) {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                tracing::warn!("Failed to adopt accepted socket: {error}");
                continue;
            },
        };
        tokio::spawn(run_connection(
            handler.clone(),
            connections.clone(),
            connection,
        ));
    }
}

async fn run_connection<H: ConnectionHandler>(
    handler: Arc<H>,
    connections: Arc<LiveConnections>,
    connection: Arc<Connection>,
) {
    let id = connections.register(connection.clone());
    handler.will_open_connection(&connection).await;
    if connection.open() {
        handler.serve_connection(connection.clone()).await;
    }
    connection.close().await;
    connections.unregister(id);
    handler.did_close_connection(&connection).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpStream,
    };

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ConnectionHandler for EchoHandler {
        async fn serve_connection(&self, connection: Arc<Connection>) {
            while let Some(data) = connection.read_data(1024, None).await {
                if data.is_empty() {
                    break;
                }
                if !connection.write_data(data, None).await {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        let address = server.local_address().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buffer = [0u8; 5];
        client.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hello");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        assert!(server.start().is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_connections() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        let address = server.local_address().unwrap();

        let _client = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        // Let the accept loop register the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections().len(), 1);

        server.stop().await;
        assert!(server.connections().is_empty());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_ipv4_clients_reach_dual_stack_listener() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        let port = server.local_address().unwrap().port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"v4").await.unwrap();
        let mut buffer = [0u8; 2];
        client.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"v4");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        server.stop().await;
        server.start().unwrap();
        assert!(server.is_running());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_write() {
        let server = Server::new(0, Arc::new(EchoHandler));
        server.start().unwrap();
        let address = server.local_address().unwrap();
        let client = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let connection = server.connections().pop().unwrap();
        connection.write_data_detached(Bytes::from_static(b"hi"));
        let mut client = client;
        let mut buffer = [0u8; 2];
        client.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hi");
        server.stop().await;
    }
}
