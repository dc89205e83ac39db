//! runboard: script dashboard server.
//!
//! Runs catalogued shell scripts inside pseudo-terminals and streams their
//! output to HTTP (SSE or chunked) and WebSocket clients.

mod bootstrap;
mod config;
mod pty;
mod server;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use pty::NativePtySpawner;
use runboard_core::{ScriptCatalog, SessionRegistry};
use server::RunboardServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// runboard: run scripts in PTYs and stream their output
#[derive(Parser, Debug)]
#[command(name = "runboard", version, about = "Script dashboard server")]
struct Cli {
    /// HTTP listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// WebSocket listen port (defaults to the HTTP port + 1)
    #[arg(long)]
    ws_port: Option<u16>,

    /// Directory holding the script catalog
    #[arg(long, env = "SCRIPTS_DIR")]
    scripts_dir: Option<String>,

    /// Directory for per-run log files
    #[arg(long, env = "LOGS_DIR")]
    logs_dir: Option<String>,

    /// Workspace root; grouped scripts run in `<workspace>/<group>`
    #[arg(long, env = "WORKSPACE")]
    workspace: Option<String>,

    /// Replay buffer size per session, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.runboard/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            ws_port: self.ws_port,
            scripts_dir: self.scripts_dir.clone(),
            logs_dir: self.logs_dir.clone(),
            workspace: self.workspace.clone(),
            buffer_size: self.buffer_size,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting runboard");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = bootstrap::prepare_directories(&server_config) {
        error!(error = %e, "failed to prepare directories");
        std::process::exit(1);
    }

    let catalog = ScriptCatalog::new(&server_config.scripts_dir, &server_config.workspace);
    let registry = Arc::new(SessionRegistry::new(
        catalog,
        Arc::new(NativePtySpawner),
        server_config.launch_settings(),
    ));

    let server = RunboardServer::new(server_config, registry.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                registry.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    registry.shutdown().await;
    info!("runboard stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
