use std::{
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use logging::{
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
use tokio::sync::Notify;

use crate::consts;

/// Browser shell served on `/`: renders the full history, then keeps
/// long-polling `/log?after=` for deltas.
const HTML_SHELL: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>Log Viewer</title>
<style>
body { background: #111; color: #ddd; font-family: monospace; margin: 8px; }
span { white-space: pre-wrap; }
.level-0 { color: #2aa198; }
.level-1 { color: #268bd2; }
.level-3 { color: #b58900; }
.level-4 { color: #dc322f; }
.level-5 { color: #d33682; }
.level-6 { color: #dc322f; font-weight: bold; }
</style>
</head>
<body>
<pre id="log"></pre>
<script>
let last = 0;
async function poll(url) {
  const response = await fetch(url);
  const records = await response.json();
  const log = document.getElementById("log");
  for (const [time, level, tag, message] of records) {
    last = Math.max(last, time);
    const line = document.createElement("span");
    line.className = "level-" + level;
    line.textContent = (tag ? "[" + tag + "] " : "") + message + "\n";
    log.appendChild(line);
  }
  window.scrollTo(0, document.body.scrollHeight);
}
(async () => {
  await poll("/log");
  for (;;) {
    try {
      await poll("/log?after=" + last);
    } catch (error) {
      await new Promise(resolve => setTimeout(resolve, 1000));
    }
  }
})();
</script>
</body>
</html>
"#;

struct HttpPeerHandler {
    history: Arc<dyn HistorySink>,
    new_record: Notify,
}

impl HttpPeerHandler {
    /// Returns records newer than `after`, blocking up to the long-poll
    /// timeout for one to arrive.
    async fn poll_records(&self, after: f64) -> Vec<LogRecord> {
        let deadline = Instant::now() + consts::LONG_POLL_TIMEOUT;
        loop {
            // Register for wakeups before querying so a record landing
            // between the query and the wait is not missed.
            let notified = self.new_record.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.history.records_after(after).await {
                Ok(records) if !records.is_empty() => return records,
                Ok(_) => {},
                Err(error) => {
                    tracing::warn!("Failed to query history: {error}");
                    return Vec::new();
                },
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    async fn respond(&self, request_target: &str) -> Vec<u8> {
        match request_target {
            "/" => response("200 OK", "text/html", HTML_SHELL.as_bytes()),
            target if target == "/log" || target.starts_with("/log?") => {
                let after = match parse_after(target) {
                    Ok(after) => after,
                    Err(()) => return bad_request(),
                };
                let records = match after {
                    // Full dump: no blocking.
                    None => self
                        .history
                        .records_after(0.0)
                        .await
                        .unwrap_or_default(),
                    Some(after) => self.poll_records(after).await,
                };
                match encode_records(&records) {
                    Ok(body) => response("200 OK", "application/json", &body),
                    Err(error) => {
                        tracing::warn!("Failed to encode records: {error}");
                        bad_request()
                    },
                }
            },
            _ => bad_request(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for HttpPeerHandler {
    async fn serve_connection(&self, connection: Arc<Connection>) {
        let Some(request) = read_request(&connection).await else {
            if connection.is_opened() {
                connection
                    .write_data(Bytes::from(bad_request()), None)
                    .await;
            }
            return;
        };
        let body = match parse_request_line(&request) {
            Some(target) => self.respond(&target).await,
            None => bad_request(),
        };
        connection.write_data(Bytes::from(body), None).await;
    }
}

/// Reads until the end of the header block, bounded to the maximum request
/// size. The body, if any, is ignored.
async fn read_request(connection: &Arc<Connection>) -> Option<String> {
    let mut collected: Vec<u8> = Vec::new();
    loop {
        let data = connection
            .read_data(consts::READ_CHUNK_SIZE, None)
            .await?;
        if data.is_empty() {
            return None;
        }
        collected.extend_from_slice(&data);
        if collected.len() > consts::MAX_HTTP_REQUEST_BYTES {
            return None;
        }
        if collected.windows(4).any(|window| window == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&collected).into_owned());
        }
    }
}

/// Returns the request target of a well-formed `GET` request line.
fn parse_request_line(request: &str) -> Option<String> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if method != "GET" || !version.starts_with("HTTP/1.") {
        return None;
    }
    Some(target.to_owned())
}

/// `None` means a full dump was requested; `Some` carries the long-poll
/// watermark.
fn parse_after(target: &str) -> Result<Option<f64>, ()> {
    let Some((_, query)) = target.split_once('?') else {
        return Ok(None);
    };
    for pair in query.split('&') {
        if let Some(("after", value)) = pair.split_once('=') {
            return value.parse::<f64>().map(Some).map_err(|_| ());
        }
    }
    Ok(None)
}

fn encode_records(records: &[LogRecord]) -> anyhow::Result<Vec<u8>> {
    let rows: Vec<(f64, u8, Option<&str>, &str)> = records
        .iter()
        .map(|record| {
            (
                record.absolute_time,
                record.level as u8,
                record.tag.as_deref(),
                record.message.as_str(),
            )
        })
        .collect();
    Ok(serde_json::to_vec(&rows)?)
}

fn response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: \
         {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn bad_request() -> Vec<u8> {
    response("400 Bad Request", "text/plain", b"bad request")
}

/// Minimal HTTP/1.1 log viewer: `/` serves the HTML shell, `/log` dumps the
/// full history as JSON, `/log?after=` long-polls for newer records. Every
/// record is appended to the history sink, which this sink requires.
pub struct HttpServerSink {
    options: SinkOptions,
    handler: Arc<HttpPeerHandler>,
    server: Server<HttpPeerHandler>,
}

impl Default for HttpServerSink {
    /// Port 8080 with an in-memory history.
    fn default() -> Self {
        Self::new(consts::DEFAULT_HTTP_PORT)
    }
}

impl HttpServerSink {
    pub fn new(port: u16) -> Self {
        Self::with_history(port, Arc::new(MemoryHistory::new()))
    }

    pub fn with_history(port: u16, history: Arc<dyn HistorySink>) -> Self {
        let handler = Arc::new(HttpPeerHandler {
            history,
            new_record: Notify::new(),
        });
        let server = Server::new(port, handler.clone());
        Self {
            options: SinkOptions::default(),
            handler,
            server,
        }
    }

    pub fn local_address(&self) -> Option<std::net::SocketAddr> {
        self.server.local_address()
    }
}

#[async_trait]
impl Sink for HttpServerSink {
    fn options(&self) -> &SinkOptions {
        &self.options
    }

    async fn open(&self) -> bool {
        match self.server.start() {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("Failed to start HTTP sink: {error}");
                false
            },
        }
    }

    async fn log_record(&self, record: &LogRecord) {
        if let Err(error) = self.handler.history.append_record(record).await {
            tracing::warn!("Failed to append record to history: {error}");
            return;
        }
        self.handler.new_record.notify_waiters();
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
    };
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpStream,
    };

    use super::*;

    async fn request(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut body = Vec::new();
        tokio::time::timeout(Duration::from_secs(35), stream.read_to_end(&mut body))
            .await
            .expect("response timed out")
            .unwrap();
        String::from_utf8_lossy(&body).into_owned()
    }

    async fn http_fixture() -> (Facility, Arc<HttpServerSink>, u16) {
        let facility = Facility::new();
        facility.set_min_log_level(LevelFilter::Debug);
        let sink = Arc::new(HttpServerSink::new(0));
        assert!(facility.add_sink(sink.clone()).await);
        let port = sink.local_address().unwrap().port();
        (facility, sink, port)
    }

    #[tokio::test]
    async fn test_serves_html_shell() {
        let (facility, sink, port) = http_fixture().await;
        let response = request(port, "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("text/html"));
        assert!(response.contains("<html>"));

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }

    #[tokio::test]
    async fn test_full_dump() {
        let (facility, sink, port) = http_fixture().await;
        facility.log_message(Some("web"), LogLevel::Warning, "dumped");
        facility.drain().await;

        let response = request(port, "/log").await;
        assert!(response.contains("application/json"));
        assert!(response.contains("\"dumped\""));
        assert!(response.contains("\"web\""));

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }

    #[tokio::test]
    async fn test_long_poll_waits_for_new_record() {
        let (facility, sink, port) = http_fixture().await;
        facility.log_message(None, LogLevel::Info, "old");
        facility.drain().await;
        let watermark = logging::record::unix_time_now();

        let started = Instant::now();
        let poller = tokio::spawn(async move {
            request(port, &format!("/log?after={watermark}")).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        facility.log_message(None, LogLevel::Info, "fresh");

        let response = poller.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(response.contains("\"fresh\""));
        assert!(!response.contains("\"old\""));

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }

    #[tokio::test]
    async fn test_rejects_unknown_requests() {
        let (facility, sink, port) = http_fixture().await;
        let response = request(port, "/secret").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert!(String::from_utf8_lossy(&body).starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let as_dyn: Arc<dyn Sink> = sink.clone();
        facility.remove_sink(&as_dyn);
    }
}
