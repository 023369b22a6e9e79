use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4310;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── SyncConfig ───────────────────────────────────────────────────────────────

/// Fan-out and reconnection tuning (`[sync]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Max deltas buffered for a disconnected client before a full resync is
    /// forced (default: 256).
    pub buffer_limit: usize,
    /// How long a disconnected client's backlog is retained, in seconds
    /// (default: 300).
    pub buffer_retention_secs: u64,
    /// Handshake deadline for a new connection, in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Client-side wait for a `subscription_success` ack before re-sending
    /// the join, in seconds (default: 5).
    pub ack_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            buffer_limit: 256,
            buffer_retention_secs: 300,
            connect_timeout_secs: 10,
            ack_timeout_secs: 5,
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4310).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1"; use "0.0.0.0" for LAN access).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,taskd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured).
    log_format: Option<String>,
    /// Sync tuning (`[sync]`).
    sync: Option<SyncConfig>,
    /// Per-domain client allowlists (`[domains]`). A domain absent from the
    /// table is open to every authenticated client.
    domains: Option<HashMap<String, Vec<String>>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── ServerConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Log output format: "pretty" (default) | "json".
    pub log_format: String,
    /// Bind address for the WebSocket server (TASKD_BIND env var).
    pub bind_address: String,
    pub sync: SyncConfig,
    /// Per-domain client allowlists for `domain:*` channels.
    pub domains: HashMap<String, Vec<String>>,
}

impl ServerConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("TASKD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let bind_address = bind_address
            .or(std::env::var("TASKD_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let sync = toml.sync.unwrap_or_default();
        let domains = toml.domains.unwrap_or_default();

        Self {
            port,
            data_dir,
            log,
            log_format,
            bind_address,
            sync,
            domains,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/taskd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("taskd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/taskd or ~/.local/share/taskd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("taskd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("taskd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\taskd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("taskd");
        }
    }
    // Fallback
    PathBuf::from(".taskd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_toml() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.sync.buffer_limit, 256);
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_cli_overrides_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 5000\nlog = \"debug\"\n\n[sync]\nbuffer_limit = 8\n\n[domains]\nprofessional = [\"c1\"]\n",
        )
        .unwrap();

        let config = ServerConfig::new(Some(6000), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, 6000);
        assert_eq!(config.log, "debug");
        assert_eq!(config.sync.buffer_limit, 8);
        assert_eq!(config.domains["professional"], vec!["c1".to_string()]);
    }
}
