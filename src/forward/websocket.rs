use anyhow::{anyhow, Context, Result};
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect, Message, WebSocket};
use url::Url;

use super::{ResultPayload, ResultTransport};

type WsStream = WebSocket<MaybeTlsStream<TcpStream>>;

/// One JSON text frame per result; the collector acknowledges each with
/// `{"status":"ok"}`. The connection is opened lazily and dropped on any
/// error so the next send reconnects.
pub struct WebSocketTransport {
    url: Url,
    timeout: Duration,
    socket: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            socket: None,
        }
    }

    fn socket(&mut self) -> Result<&mut WsStream> {
        if self.socket.is_none() {
            let (socket, _response) = connect(self.url.as_str())
                .with_context(|| format!("connect websocket {}", self.url))?;
            if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
                stream
                    .set_read_timeout(Some(self.timeout))
                    .context("set websocket read timeout")?;
            }
            log::info!("connected to collector websocket {}", self.url);
            self.socket = Some(socket);
        }
        self.socket
            .as_mut()
            .ok_or_else(|| anyhow!("websocket not connected"))
    }

    fn exchange(&mut self, text: String) -> Result<()> {
        let socket = self.socket()?;
        socket.send(Message::Text(text)).context("send result frame")?;
        loop {
            match socket.read().context("read collector ack")? {
                Message::Text(reply) => return check_ack(&reply),
                Message::Binary(reply) => {
                    let reply = String::from_utf8_lossy(&reply).into_owned();
                    return check_ack(&reply);
                }
                Message::Close(_) => return Err(anyhow!("collector closed the websocket")),
                // Ping/pong are answered by tungstenite on the next read.
                _ => continue,
            }
        }
    }
}

impl ResultTransport for WebSocketTransport {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    fn send(&mut self, payload: &ResultPayload) -> Result<()> {
        let text = serde_json::to_string(payload).context("serialize result")?;
        let result = self.exchange(text);
        if result.is_err() {
            self.socket = None;
        }
        result
    }
}

fn check_ack(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).with_context(|| format!("invalid collector ack {:?}", reply))?;
    match value.get("status").and_then(|s| s.as_str()) {
        Some("ok") => Ok(()),
        _ => Err(anyhow!("collector replied {}", value)),
    }
}
