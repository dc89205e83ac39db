//! Interactive WebSocket transport using tokio-tungstenite.
//!
//! Clients connect with `?pid=<session id>`. Output is pushed as binary
//! messages; text or binary messages from the client are written to the
//! process. After the process exits the socket stays open read-only.

use futures_util::{SinkExt, StreamExt};
use runboard_core::{RunboardError, RunboardResult, SessionId, SessionRegistry};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Input messages larger than this are refused.
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Raw query string of the upgrade request.
    pub query: Option<String>,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RunboardResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RunboardError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");
    Ok(accept_connections(tcp_listener))
}

/// Run the handshake for every connection on an already bound listener.
pub fn accept_connections(tcp_listener: TcpListener) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut query = None;
                        let capture = |req: &Request, resp: Response| {
                            query = req.uri().query().map(str::to_owned);
                            Ok::<_, ErrorResponse>(resp)
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, capture).await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    query,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

/// Pull the `pid` parameter out of a query string.
pub fn parse_pid(query: Option<&str>) -> Option<SessionId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "pid")
        .and_then(|(_, value)| value.parse().ok())
}

/// Serve one interactive client until it goes away.
pub async fn serve_duplex(
    registry: Arc<SessionRegistry>,
    conn: WebSocketConnection,
) -> RunboardResult<()> {
    let WebSocketConnection {
        mut ws_stream,
        remote_addr,
        query,
    } = conn;

    let attached = match parse_pid(query.as_deref()) {
        Some(pid) => registry.attach_duplex(pid).await,
        None => Err(RunboardError::Transport("missing or invalid pid".into())),
    };
    let mut channel = match attached {
        Ok(channel) => channel,
        Err(e) => {
            debug!(remote = %remote_addr, error = %e, "rejecting WebSocket client");
            let body = json!({ "error": e.to_string() }).to_string();
            let _ = ws_stream.send(Message::Text(body.into())).await;
            let _ = ws_stream.close(None).await;
            return Ok(());
        }
    };

    let session_id = channel.session_id();
    info!(session_id, remote = %remote_addr, "interactive client attached");

    let (mut sink, mut inbound) = ws_stream.split();
    let mut output_done = false;

    loop {
        tokio::select! {
            output = channel.next_output(), if !output_done => match output {
                Some(bytes) => {
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        debug!(session_id, error = %e, "WS send failed");
                        break;
                    }
                }
                None => output_done = true,
            },
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    channel.send_input(text.as_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        warn!(session_id, size = data.len(), "oversized WS frame dropped");
                        continue;
                    }
                    channel.send_input(&data);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id, error = %e, "WS recv failed");
                    break;
                }
            },
        }
    }

    channel.detach();
    info!(session_id, remote = %remote_addr, "interactive client detached");
    Ok(())
}
