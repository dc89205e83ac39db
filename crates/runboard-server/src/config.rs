//! Server configuration: TOML file + CLI overrides.

use runboard_core::{default_shell, LaunchSettings, RunboardError, RunboardResult, DEFAULT_REPLAY_CAPACITY};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub pty: PtySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket port; defaults to `port + 1`.
    pub ws_port: Option<u16>,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Exported to scripts as `BASE_URL`; defaults to `http://127.0.0.1:<port>`.
    pub base_url: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_port: None,
            bind: default_bind(),
            base_url: None,
        }
    }
}

/// `[paths]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            logs_dir: default_logs_dir(),
            workspace: default_workspace(),
        }
    }
}

/// `[pty]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PtySection {
    pub shell: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for PtySection {
    fn default() -> Self {
        Self {
            shell: None,
            cols: default_cols(),
            rows: default_rows(),
            buffer_size: default_buffer_size(),
            term: default_term(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_scripts_dir() -> String {
    "scripts".to_string()
}
fn default_logs_dir() -> String {
    "logs".to_string()
}
fn default_workspace() -> String {
    "workspace".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    30
}
fn default_buffer_size() -> usize {
    DEFAULT_REPLAY_CAPACITY
}
fn default_term() -> String {
    "xterm-color".to_string()
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
    pub scripts_dir: Option<String>,
    pub logs_dir: Option<String>,
    pub workspace: Option<String>,
    pub buffer_size: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub ws_port: u16,
    pub base_url: String,
    pub scripts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub workspace: PathBuf,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub buffer_size: usize,
    pub term: String,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> RunboardResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(expanded) if expanded.exists() => {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| RunboardError::Config(format!("config parse error: {e}")))?
            }
            Some(expanded) => {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Ok(Self::merge(file_config, overrides))
    }

    fn merge(file: ConfigFile, overrides: &ConfigOverrides) -> Self {
        let port = overrides.port.unwrap_or(file.server.port);
        let ws_port = overrides
            .ws_port
            .or(file.server.ws_port)
            .unwrap_or_else(|| port.wrapping_add(1));
        let base_url = file
            .server
            .base_url
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));
        let path = |cli: &Option<String>, file: String| {
            expand_tilde_str(cli.as_deref().unwrap_or(&file))
        };

        Self {
            bind: file.server.bind,
            port,
            ws_port,
            base_url,
            scripts_dir: path(&overrides.scripts_dir, file.paths.scripts_dir),
            logs_dir: path(&overrides.logs_dir, file.paths.logs_dir),
            workspace: path(&overrides.workspace, file.paths.workspace),
            shell: file
                .pty
                .shell
                .unwrap_or_else(|| default_shell().to_string()),
            cols: file.pty.cols,
            rows: file.pty.rows,
            buffer_size: overrides.buffer_size.unwrap_or(file.pty.buffer_size),
            term: file.pty.term,
        }
    }

    /// How the session registry should launch scripts.
    ///
    /// Scripts inherit this process's environment plus `BASE_URL`,
    /// `WORKSPACE` and `TERM`.
    pub fn launch_settings(&self) -> LaunchSettings {
        let mut base_env: HashMap<String, String> = std::env::vars().collect();
        base_env.insert("BASE_URL".into(), self.base_url.clone());
        base_env.insert(
            "WORKSPACE".into(),
            self.workspace.to_string_lossy().into_owned(),
        );
        base_env.insert("TERM".into(), self.term.clone());

        LaunchSettings {
            shell: self.shell.clone(),
            logs_dir: self.logs_dir.clone(),
            base_env,
            cols: self.cols,
            rows: self.rows,
            buffer_capacity: self.buffer_size,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.ws_port, 3001);
        assert_eq!(cfg.base_url, "http://127.0.0.1:3000");
        assert_eq!(cfg.scripts_dir, PathBuf::from("scripts"));
        assert_eq!(cfg.buffer_size, 300_000);
        assert_eq!((cfg.cols, cfg.rows), (80, 30));
        assert_eq!(cfg.term, "xterm-color");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(
            Some(&dir.path().join("absent.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn file_values_then_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8080
base_url = "http://dash.local"

[paths]
scripts_dir = "/srv/scripts"
logs_dir = "/srv/logs"

[pty]
shell = "/bin/zsh"
cols = 120
buffer_size = 4096
"#,
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(&path), &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ws_port, 8081);
        assert_eq!(cfg.base_url, "http://dash.local");
        assert_eq!(cfg.scripts_dir, PathBuf::from("/srv/scripts"));
        assert_eq!(cfg.workspace, PathBuf::from("workspace"));
        assert_eq!(cfg.shell, "/bin/zsh");
        assert_eq!((cfg.cols, cfg.rows), (120, 30));

        let overrides = ConfigOverrides {
            port: Some(9000),
            logs_dir: Some("/tmp/logs".into()),
            buffer_size: Some(10),
            ..Default::default()
        };
        let cfg = ServerConfig::load(Some(&path), &overrides).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ws_port, 9001);
        assert_eq!(cfg.logs_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(cfg.buffer_size, 10);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = ServerConfig::load(Some(&path), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, RunboardError::Config(_)));
    }

    #[test]
    fn launch_settings_export_dashboard_env() {
        let cfg = ServerConfig::load(None, &ConfigOverrides::default()).unwrap();
        let launch = cfg.launch_settings();
        assert_eq!(launch.base_env["BASE_URL"], "http://127.0.0.1:3000");
        assert_eq!(launch.base_env["WORKSPACE"], "workspace");
        assert_eq!(launch.base_env["TERM"], "xterm-color");
        assert_eq!(launch.buffer_capacity, 300_000);
    }
}
