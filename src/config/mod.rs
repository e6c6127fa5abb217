use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::BridgeError;

/// Default WebSocket path the backend serves its plugin endpoint on.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Bridge runtime settings. Every field has a default so an empty or missing
/// file is a valid configuration.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub backend: BackendConfig,
    pub restart: RestartConfig,
    pub connection: ConnectionConfig,
    pub requests: RequestConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Where the backend binary is extracted to.
    pub runtime_dir: PathBuf,
    /// Directory bundle root used by the standalone runner; `None` → embedded bundle.
    pub bundle_dir: Option<PathBuf>,
    pub ws_path: String,
    /// Overrides for the reported host platform.
    pub os: Option<String>,
    pub arch: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub readiness_timeout_ms: u64,
    pub stop_grace_ms: u64,
    /// Regex with a named `level` group used to grade forwarded output lines.
    pub log_pattern: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub window_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub send_queue_capacity: usize,
    pub close_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    pub default_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("./runtime"),
            bundle_dir: None,
            ws_path: DEFAULT_WS_PATH.to_string(),
            os: None,
            arch: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            readiness_timeout_ms: 10_000,
            stop_grace_ms: 5_000,
            log_pattern: None,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_secs: 300,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            send_queue_capacity: 1024,
            close_timeout_ms: 2_000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
        }
    }
}

impl BackendConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl RestartConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl RequestConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No bridge config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))
            }
        };
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, BridgeError> {
        let cfg: Self = toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if !self.backend.ws_path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "backend.ws_path must start with '/', got '{}'",
                self.backend.ws_path
            )));
        }
        if self.connection.send_queue_capacity == 0 {
            return Err(BridgeError::Config(
                "connection.send_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.connection.initial_backoff_ms == 0 || self.restart.initial_delay_ms == 0 {
            return Err(BridgeError::Config("backoff delays must be non-zero".to_string()));
        }
        if self.connection.initial_backoff_ms > self.connection.max_backoff_ms
            || self.restart.initial_delay_ms > self.restart.max_delay_ms
        {
            return Err(BridgeError::Config(
                "initial backoff must not exceed its cap".to_string(),
            ));
        }
        if let Some(pattern) = &self.backend.log_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| BridgeError::Config(format!("backend.log_pattern: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.backend.ws_path, "/ws");
        assert_eq!(cfg.restart.max_restarts, 5);
        assert_eq!(cfg.connection.initial_backoff(), Duration::from_millis(500));
        assert_eq!(cfg.connection.max_backoff(), Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = BridgeConfig::from_toml(
            r#"
            [backend]
            runtime_dir = "/var/lib/beacon"
            args = ["--verbose"]

            [backend.env]
            BEACON_DATA = "/srv/data"

            [restart]
            max_restarts = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.runtime_dir, PathBuf::from("/var/lib/beacon"));
        assert_eq!(cfg.backend.args, vec!["--verbose".to_string()]);
        assert_eq!(cfg.backend.env.get("BEACON_DATA").map(String::as_str), Some("/srv/data"));
        assert_eq!(cfg.restart.max_restarts, 3);
        assert_eq!(cfg.restart.window_secs, 300);
        assert_eq!(cfg.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(BridgeConfig::from_toml("[backend]\nws_path = \"ws\"\n").is_err());
        assert!(BridgeConfig::from_toml("[connection]\nsend_queue_capacity = 0\n").is_err());
        assert!(BridgeConfig::from_toml("[backend]\nlog_pattern = \"(unclosed\"\n").is_err());
        assert!(BridgeConfig::from_toml("[restart]\ninitial_delay_ms = 60000\n").is_err());
        assert!(BridgeConfig::from_toml("not toml at all = = =").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BridgeConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, BridgeConfig::default());
    }
}
