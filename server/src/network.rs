//! Server network layer: WebSocket transport and the relay's event loop

use crate::registry::{Connection, ConnectionId, Frame};
use crate::relay::Relay;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Messages sent from connection tasks to the relay loop
#[derive(Debug)]
pub enum HubEvent {
    Connected(Connection),
    Frame { id: ConnectionId, text: String },
    Disconnected { id: ConnectionId },
}

/// WebSocket server feeding a single [`Relay`]
pub struct RelayServer {
    listener: TcpListener,
    relay: Relay,
}

impl RelayServer {
    pub async fn bind(addr: &str, relay: Relay) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(RelayServer { listener, relay })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections and drives the relay until the listener task ends
    pub async fn run(self) -> io::Result<()> {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_connections(self.listener, hub_tx));

        let relay = run_hub(self.relay, hub_rx).await;
        accept_task.abort();
        info!("Relay stopped with {} sessions", relay.sessions().len());
        Ok(())
    }
}

/// Applies transport events to the relay one at a time.
///
/// Returns the relay once every event sender has gone away.
pub async fn run_hub(mut relay: Relay, mut events: mpsc::UnboundedReceiver<HubEvent>) -> Relay {
    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Connected(connection) => relay.connect(connection),
            HubEvent::Frame { id, text } => relay.handle_text(id, &text),
            HubEvent::Disconnected { id } => relay.disconnect(id),
        }
    }
    relay
}

async fn accept_connections(listener: TcpListener, hub: mpsc::UnboundedSender<HubEvent>) {
    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_connection(stream, addr, id, hub.clone()));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Runs one participant connection until the peer goes away
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    hub: mpsc::UnboundedSender<HubEvent>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Frame>();

    if hub
        .send(HubEvent::Connected(Connection::new(id, outbox_tx, Some(addr))))
        .is_err()
    {
        error!("Relay loop is gone, dropping connection from {}", addr);
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                debug!("Write to connection {} failed: {}", id, e);
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(result) = read.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Dropping non-UTF-8 binary frame from connection {}", id);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Connection {} read error: {}", id, e);
                break;
            }
        };

        if hub.send(HubEvent::Frame { id, text }).is_err() {
            break;
        }
    }

    let _ = hub.send(HubEvent::Disconnected { id });
    writer.abort();
}
