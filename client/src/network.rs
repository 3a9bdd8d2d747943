use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientMessage, ServerMessage, KEEPALIVE_TOKEN};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Interval between keep-alive frames
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One participant's WebSocket connection to the relay, bound to a session
pub struct RelayClient {
    session_id: String,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

/// Accepts `host:port` as well as a full `ws://` / `wss://` URL
pub fn relay_url(server: &str) -> String {
    if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_owned()
    } else {
        format!("ws://{}", server)
    }
}

impl RelayClient {
    pub async fn connect(
        server: &str,
        session_id: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let url = relay_url(server);
        info!("Connecting to relay at {}", url);

        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();

        Ok(RelayClient {
            session_id: session_id.to_owned(),
            write,
            read,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
        let frame = message.to_frame(&self.session_id)?;
        debug!("Sending '{}'", message.kind());
        self.write.send(Message::Text(frame)).await?;
        Ok(())
    }

    pub async fn send_keepalive(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(KEEPALIVE_TOKEN.to_owned()))
            .await?;
        Ok(())
    }

    /// Waits for the next message addressed to this client's session.
    ///
    /// Returns `Ok(None)` once the relay closes the connection. Frames that
    /// do not decode are skipped.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>, Box<dyn std::error::Error>> {
        while let Some(result) = self.read.next().await {
            let text = match result? {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };

            match ServerMessage::from_frame(&text) {
                Ok((Some(session_id), message)) if session_id == self.session_id => {
                    return Ok(Some(message));
                }
                Ok((session_id, message)) => {
                    debug!(
                        "Ignoring '{}' for session {:?}",
                        message.kind(),
                        session_id
                    );
                }
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }
        Ok(None)
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url() {
        assert_eq!(relay_url("127.0.0.1:8080"), "ws://127.0.0.1:8080");
        assert_eq!(relay_url("ws://relay:9000/ws"), "ws://relay:9000/ws");
        assert_eq!(relay_url("wss://relay.example"), "wss://relay.example");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never a relay.
        let result = RelayClient::connect("127.0.0.1:1", "S1").await;
        assert!(result.is_err());
    }
}
