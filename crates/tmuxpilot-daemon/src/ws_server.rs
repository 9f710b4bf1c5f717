use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::hub::{ClientMessage, Hub, ServerMessage, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_MISS_LIMIT};

/// WebSocket transport for the Realtime Fan-Out Hub. Every connection
/// is authenticated and rate-limited by the hub itself; this layer only
/// moves bytes between the socket and the hub's per-connection outbox.
pub struct WsServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    cancel: CancellationToken,
}

impl WsServer {
    pub fn new(addr: SocketAddr, hub: Arc<Hub>, cancel: CancellationToken) -> Self {
        Self { addr, hub, cancel }
    }

    /// Run the accept loop and the hub's own heartbeat ticker until
    /// cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "hub: websocket server listening");

        let heartbeat_hub = self.hub.clone();
        let heartbeat_cancel = self.cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let dead = heartbeat_hub.heartbeat_tick(DEFAULT_HEARTBEAT_MISS_LIMIT).await;
                        if !dead.is_empty() {
                            tracing::debug!(count = dead.len(), "hub: evicted unresponsive connections");
                        }
                    }
                    _ = heartbeat_cancel.cancelled() => break,
                }
            }
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let hub = self.hub.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, hub, cancel).await {
                                    tracing::debug!(%peer, error = %e, "hub: connection closed with error");
                                }
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "hub: TCP accept failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("hub: websocket server shutting down");
                    break;
                }
            }
        }

        let _ = heartbeat.await;
        Ok(())
    }
}

/// Extract `api_key` from a WebSocket handshake request's query string,
/// e.g. `/ws?api_key=...`. Values are not percent-decoded; API keys are
/// expected to be plain alphanumeric tokens.
fn extract_api_key(uri: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "api_key").then(|| value.to_string())
    })
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut api_key: Option<String> = None;
    let callback = |req: &tokio_tungstenite::tungstenite::handshake::server::Request, resp| {
        api_key = extract_api_key(req.uri().to_string().as_str());
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let authenticated = hub.authenticate(api_key.as_deref(), peer.ip().is_loopback());
    tracing::debug!(%peer, authenticated, "hub: connection accepted");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (connection_id, mut outbox) = hub.register(authenticated).await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(parsed) => hub.handle_message(&connection_id, parsed).await,
                            Err(e) => tracing::debug!(%peer, error = %e, "hub: dropped malformed client frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%peer, error = %e, "hub: websocket read error");
                        break;
                    }
                }
            }
            out = outbox.recv() => {
                match out {
                    Some(server_msg) => {
                        let text = serde_json::to_string(&server_msg)?;
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    hub.unregister(&connection_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_extracted_from_query_string() {
        assert_eq!(extract_api_key("/ws?api_key=secret123"), Some("secret123".to_string()));
        assert_eq!(extract_api_key("/ws?other=1&api_key=abc"), Some("abc".to_string()));
    }

    #[test]
    fn missing_api_key_is_none() {
        assert_eq!(extract_api_key("/ws"), None);
        assert_eq!(extract_api_key("/ws?other=1"), None);
    }
}
