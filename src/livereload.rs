//! Browser live reload over a local WebSocket endpoint.
//!
//! The notifier serves two things on one listener: the client script at
//! `/livereload.js` (plain HTTP, detected by peeking the request line) and
//! a WebSocket endpoint everywhere else. The only outbound frame is an
//! opaque `full_reload` text message broadcast to every connected client.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::Result;

/// Live-reload section of the project state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveReloadConfig {
    /// Disables the notifier entirely.
    pub disable: bool,
    /// Listen port; 0 also disables the notifier.
    pub port: u16,
}

impl Default for LiveReloadConfig {
    fn default() -> Self {
        Self {
            disable: false,
            port: 35729,
        }
    }
}

/// Push channel that tells connected browsers to do a full page reload.
#[derive(Clone)]
pub struct LiveReload {
    config: LiveReloadConfig,
    reload_tx: broadcast::Sender<()>,
}

impl LiveReload {
    pub fn new(config: LiveReloadConfig) -> Self {
        let (reload_tx, _) = broadcast::channel(16);
        Self { config, reload_tx }
    }

    fn enabled(&self) -> bool {
        !self.config.disable && self.config.port > 0
    }

    /// Broadcasts the reload signal. A no-op when disabled or when no
    /// client is connected.
    pub fn send_reload_signal(&self) {
        if self.enabled() {
            let _ = self.reload_tx.send(());
        }
    }

    /// Serves the reload endpoint until the task is dropped. Returns
    /// immediately, without error, when the notifier is disabled —
    /// disabling live reload must never be a startup failure.
    pub async fn listen_and_serve(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let listener = TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        debug!(port = self.config.port, "live reload listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let reload_rx = self.reload_tx.subscribe();
            let port = self.config.port;
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, reload_rx, port).await {
                    debug!(err = %err, "live reload connection ended");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    mut reload_rx: broadcast::Receiver<()>,
    port: u16,
) -> Result<()> {
    // The client script and the WebSocket endpoint share the port; a peek
    // at the request line tells them apart without consuming the stream.
    const SCRIPT_REQUEST: &[u8] = b"GET /livereload.js";
    let mut peek_buf = [0u8; SCRIPT_REQUEST.len()];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n == SCRIPT_REQUEST.len() && peek_buf == *SCRIPT_REQUEST {
        return serve_client_script(stream, port).await;
    }

    let ws = tokio_tungstenite::accept_async(stream).await.map_err(|err| {
        warn!(err = %err, "websocket handshake failed");
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    })?;
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    // Inbound traffic carries no meaning; only liveness.
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            signal = reload_rx.recv() => {
                match signal {
                    Ok(()) => {
                        if sink.send(Message::Text("full_reload".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
    Ok(())
}

async fn serve_client_script(mut stream: TcpStream, port: u16) -> Result<()> {
    let body = client_script(port);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/javascript; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// The script a page includes before its closing body tag:
/// `<script src="http://localhost:35729/livereload.js"></script>`.
///
/// The client reloads on any message and treats connection closure as
/// informational only; it makes no reconnect attempt, since a successful
/// reload re-executes the script and opens a fresh connection anyway.
fn client_script(port: u16) -> String {
    format!(
        r#"(function () {{
    const scheme = document.location.protocol == "https:" ? "wss" : "ws";
    const endpoint = scheme + "://" + document.location.hostname + ":{port}/livereload";

    const w = new WebSocket(endpoint);
    w.onopen = function () {{
        console.info("LiveReload: initialization");
    }};
    w.onclose = function () {{
        console.info("LiveReload: terminated");
    }};
    w.onmessage = function (message) {{
        window.location.reload();
    }};
}}());"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let reload = LiveReload::new(LiveReloadConfig {
            disable: true,
            port: 35729,
        });
        // Must return immediately instead of binding a listener.
        reload.listen_and_serve().await.unwrap();
        reload.send_reload_signal();

        let reload = LiveReload::new(LiveReloadConfig {
            disable: false,
            port: 0,
        });
        reload.listen_and_serve().await.unwrap();
    }

    #[test]
    fn client_script_embeds_the_configured_port() {
        let script = client_script(4040);
        assert!(script.contains(":4040/livereload"));
        assert!(script.contains("window.location.reload()"));
    }

    #[tokio::test]
    async fn script_is_served_over_plain_http() {
        // Bind an ephemeral port manually to avoid clashes between tests.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let (_tx, rx) = broadcast::channel(1);
                let _ = handle_connection(stream, rx, port).await;
            }
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"GET /livereload.js HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("livereload"));
    }
}
