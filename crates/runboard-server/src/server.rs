//! Core server: serves the HTTP API and accepts interactive WebSocket clients.

use crate::config::ServerConfig;
use crate::transport::{http, websocket};
use runboard_core::{RunboardError, RunboardResult, SessionRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct RunboardServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl RunboardServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Start listening on both the HTTP and WebSocket ports.
    ///
    /// Runs until a listener fails.
    pub async fn run(self) -> RunboardResult<()> {
        let http_addr = SocketAddr::new(self.config.bind, self.config.port);
        let ws_addr = SocketAddr::new(self.config.bind, self.config.ws_port);

        let http_listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| RunboardError::Transport(format!("HTTP bind failed: {e}")))?;
        let mut ws_rx = websocket::start_listener(ws_addr).await?;

        let app = http::router(self.registry.clone());
        let mut http_task = tokio::spawn(async move { axum::serve(http_listener, app).await });

        info!(
            http = %http_addr,
            ws = %ws_addr,
            scripts_dir = %self.config.scripts_dir.display(),
            "runboard ready"
        );

        loop {
            tokio::select! {
                ws_conn = ws_rx.recv() => {
                    let Some(ws_conn) = ws_conn else {
                        error!("WebSocket listener closed");
                        http_task.abort();
                        return Err(RunboardError::Transport("WebSocket listener closed".into()));
                    };
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = websocket::serve_duplex(registry, ws_conn).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                served = &mut http_task => {
                    return match served {
                        Ok(Ok(())) => {
                            info!("HTTP server stopped");
                            Ok(())
                        }
                        Ok(Err(e)) => Err(RunboardError::Transport(format!("HTTP server failed: {e}"))),
                        Err(e) => Err(RunboardError::Other(format!("HTTP task failed: {e}"))),
                    };
                }
            }
        }
    }
}
