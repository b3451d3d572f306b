use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use logging::{
    Formatter,
    HistorySink,
    LogRecord,
    MemoryHistory,
    Sink,
    SinkOptions,
};
use netpeer::{
    Connection,
    ConnectionHandler,
    Server,
};
use tokio::sync::mpsc;

use crate::{
    consts,
    peers::{
        SendTimeout,
        StreamCore,
    },
    telnet::{
        protocol,
        session::{
            parse_command_line,
            sanitize_for_terminal,
            TelnetSession,
        },
    },
};

pub type StartHandler = Box<dyn Fn(&Arc<Connection>) -> Option<String> + Send + Sync>;
pub type LineHandler = Box<dyn Fn(&Arc<Connection>, &str) -> Option<String> + Send + Sync>;
pub type CommandHandler =
    Box<dyn Fn(&Arc<Connection>, &str, &[String]) -> Option<String> + Send + Sync>;

/// Interactive behavior of each Telnet session. Handlers run on the peer's
/// session task; responses are sanitized for the terminal before writing.
pub struct TelnetConfig {
    pub prompt: String,
    pub tab_placeholder: String,
    /// 0 disables line history entirely.
    pub max_history_size: usize,
    pub should_colorize: bool,
    /// Invoked once per session, right after option negotiation; the
    /// returned banner is printed above the first prompt.
    pub start_handler: Option<StartHandler>,
    /// Invoked with each committed line.
    pub line_handler: Option<LineHandler>,
    /// Invoked with each committed line parsed into command and arguments;
    /// takes precedence over `line_handler`.
    pub command_handler: Option<CommandHandler>,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            prompt: consts::DEFAULT_PROMPT.to_owned(),
            tab_placeholder: consts::DEFAULT_TAB_PLACEHOLDER.to_owned(),
            max_history_size: usize::MAX,
            should_colorize: true,
            start_handler: None,
            line_handler: None,
            command_handler: None,
        }
    }
}

struct TelnetPeerHandler {
    core: Arc<StreamCore>,
    config: TelnetConfig,
}

impl TelnetPeerHandler {
    fn handle_line(&self, connection: &Arc<Connection>, line: &str) -> Option<String> {
        if let Some(handler) = &self.config.command_handler {
            let arguments = parse_command_line(line);
            let (command, arguments) = arguments.split_first()?;
            return handler(connection, command, arguments);
        }
        self.config.line_handler.as_ref()?(connection, line)
    }
}

#[async_trait]
impl ConnectionHandler for TelnetPeerHandler {
    async fn serve_connection(&self, connection: Arc<Connection>) {
        if !connection
            .write_data(Bytes::from_static(protocol::NEGOTIATION_BLOCK), None)
            .await
        {
            return;
        }
        let mut session = TelnetSession::new(
            self.config.prompt.clone(),
            self.config.tab_placeholder.clone(),
            self.config.max_history_size,
        );

        let mut greeting = Vec::new();
        if let Some(start) = &self.config.start_handler {
            if let Some(banner) = start(&connection) {
                greeting.extend_from_slice(&sanitize_for_terminal(&banner));
            }
        }
        greeting.extend_from_slice(session.prompt().as_bytes());
        if !connection.write_data(greeting.into(), None).await {
            return;
        }

        let (id, mut records, replay) = self.core.attach(&connection).await;
        let _registration = PeerRegistration {
            core: self.core.as_ref(),
            id,
        };

        // History replay takes the same suppress-and-redraw path as live
        // records.
        for record in &replay {
            let line = match self.core.formatter.format(record) {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!("Skipping unformattable history record: {error}");
                    continue;
                },
            };
            let bytes = session.compose_record(&line, record.level, self.config.should_colorize);
            if !connection.write_data(bytes.into(), None).await {
                return;
            }
        }

        let (input_sender, mut input) = mpsc::unbounded_channel();
        let reader = connection.clone();
        tokio::spawn(async move {
            loop {
                match reader.read_data(consts::READ_CHUNK_SIZE, None).await {
                    None => break,
                    Some(data) if data.is_empty() => break,
                    Some(data) => {
                        if input_sender.send(data).is_err() {
                            break;
                        }
                    },
                }
            }
            reader.close().await;
        });

        'session: loop {
            tokio::select! {
                received = input.recv() => {
                    let Some(received) = received else {
                        break 'session;
                    };
                    let outcome = session.feed(&received);
                    if !outcome.output.is_empty()
                        && !connection.write_data(outcome.output.into(), None).await
                    {
                        break 'session;
                    }
                    for line in &outcome.lines {
                        let mut reply = Vec::new();
                        if let Some(response) = self.handle_line(&connection, line) {
                            reply.extend_from_slice(&sanitize_for_terminal(&response));
                        }
                        reply.extend_from_slice(session.prompt().as_bytes());
                        if !connection.write_data(reply.into(), None).await {
                            break 'session;
                        }
                    }
                    if outcome.malformed {
                        tracing::warn!(
                            "Closing Telnet session from {}: malformed input",
                            connection.remote_address()
                        );
                        break 'session;
                    }
                },
                outbound = records.recv() => {
                    let Some(outbound) = outbound else {
                        break 'session;
                    };
                    let bytes = session.compose_record(
                        &outbound.line,
                        outbound.level,
                        self.config.should_colorize,
                    );
                    let written = connection.write_data(bytes.into(), None).await;
                    if let Some(ack) = outbound.ack {
                        let _ = ack.send(());
                    }
                    if !written {
                        break 'session;
                    }
                },
            }
        }
    }
}

/// Unregisters the peer on every exit path, including mid-replay failures.
struct PeerRegistration<'a> {
    core: &'a StreamCore,
    id: u64,
}

impl Drop for PeerRegistration<'_> {
    fn drop(&mut self) {
        self.core.hub.unregister(self.id);
    }
}

/// The Telnet log viewer: a line-edited terminal server that interleaves
/// live log output with an interactive prompt on every connected terminal.
/// Connect with `telnet HOST PORT`.
pub struct TelnetServerSink {
    options: SinkOptions,
    core: Arc<StreamCore>,
    server: Server<TelnetPeerHandler>,
}

impl Default for TelnetServerSink {
    /// Port 2323, history preserved.
    fn default() -> Self {
        Self::new(consts::DEFAULT_TELNET_PORT, true)
    }
}

impl TelnetServerSink {
    /// Telnet viewer on the given port; `preserve_history` replays records
    /// received since the sink was opened to newly connecting terminals.
    pub fn new(port: u16, preserve_history: bool) -> Self {
        let history: Option<Arc<dyn HistorySink>> = if preserve_history {
            Some(Arc::new(MemoryHistory::new()))
        } else {
            None
        };
        Self::with_config(
            port,
            history,
            Formatter::default(),
            SendTimeout::FireAndForget,
            TelnetConfig::default(),
        )
    }

    pub fn with_config(
        port: u16,
        history: Option<Arc<dyn HistorySink>>,
        formatter: Formatter,
        send_timeout: SendTimeout,
        config: TelnetConfig,
    ) -> Self {
        let core = Arc::new(StreamCore::new(formatter, history, send_timeout));
        let server = Server::new(
            port,
            Arc::new(TelnetPeerHandler {
                core: core.clone(),
                config,
            }),
        );
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
impl Sink for TelnetServerSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn open(&self) -> bool {
        match self.server.start() {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("Failed to start Telnet sink: {error}");
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
