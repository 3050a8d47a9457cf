//! Client configuration.
//!
//! Settings are read from `config.toml`, by default at
//! `~/.config/slotwire/config.toml`. Every key is optional:
//!
//! ```toml
//! server_addr = "10.0.0.7:7000"
//! max_concurrent_requests = 5000
//!
//! [keepalive]
//! idle_ms = 10000
//! timeout_ms = 3000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slotwire_core::DEFAULT_FLUSH_BUDGET;

use crate::error::{ClientError, ClientResult};

/// Default number of requests a client may have awaiting a response.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 1000;

/// Port used by `slotwire serve` and the default server address.
pub const DEFAULT_PORT: u16 = 7000;

/// Configuration for clients and their manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Size of the slot table. Must be in `1..u32::MAX`; the keepalive ping
    /// uses one extra slot on top.
    pub max_concurrent_requests: u32,

    /// Address the CLI connects to when none is given.
    pub server_addr: String,

    /// Set `TCP_NODELAY` on the socket.
    pub nodelay: bool,

    /// Back-to-back request batches before the flush task yields.
    pub flush_budget: u32,

    /// Keepalive settings, used by the client manager.
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            server_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            nodelay: true,
            flush_budget: DEFAULT_FLUSH_BUDGET,
            keepalive: KeepaliveSettings::default(),
        }
    }
}

/// Keepalive timings in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    /// Idle time after which a ping is sent.
    pub idle_ms: u64,

    /// How long a ping may stay unanswered before the connection is closed.
    pub timeout_ms: u64,

    /// Interval between keepalive checks.
    pub tick_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            idle_ms: 10_000,
            timeout_ms: 3_000,
            tick_ms: 1_000,
        }
    }
}

impl KeepaliveSettings {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl ClientConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("slotwire")
    }

    /// Builder: set the slot table size.
    pub fn with_max_concurrent_requests(mut self, max: u32) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Builder: set the keepalive idle time and ping timeout.
    pub fn with_keepalive(mut self, idle: Duration, timeout: Duration) -> Self {
        self.keepalive.idle_ms = duration_ms(idle);
        self.keepalive.timeout_ms = duration_ms(timeout);
        self
    }

    /// Builder: set the interval between keepalive checks.
    pub fn with_keepalive_tick(mut self, tick: Duration) -> Self {
        self.keepalive.tick_ms = duration_ms(tick);
        self
    }

    /// Builder: set `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Builder: set the flush budget.
    pub fn with_flush_budget(mut self, budget: u32) -> Self {
        self.flush_budget = budget;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.max_concurrent_requests == 0 || self.max_concurrent_requests == u32::MAX {
            return Err(ClientError::Config(format!(
                "max_concurrent_requests must be between 1 and {}, got {}",
                u32::MAX - 1,
                self.max_concurrent_requests
            )));
        }
        if self.keepalive.tick_ms == 0 {
            return Err(ClientError::Config(
                "keepalive.tick_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_concurrent_requests, DEFAULT_MAX_CONCURRENT_REQUESTS);
        assert_eq!(config.server_addr, "127.0.0.1:7000");
        assert_eq!(config.keepalive.idle(), Duration::from_secs(10));
        assert_eq!(config.keepalive.timeout(), Duration::from_secs(3));
        assert_eq!(config.keepalive.tick(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = ClientConfig::default()
            .with_max_concurrent_requests(8)
            .with_keepalive(Duration::from_millis(250), Duration::from_millis(100))
            .with_keepalive_tick(Duration::from_millis(20))
            .with_nodelay(false)
            .with_flush_budget(4);
        assert_eq!(config.max_concurrent_requests, 8);
        assert_eq!(config.keepalive.idle_ms, 250);
        assert_eq!(config.keepalive.timeout_ms, 100);
        assert_eq!(config.keepalive.tick_ms, 20);
        assert!(!config.nodelay);
        assert_eq!(config.flush_budget, 4);
    }

    #[test]
    fn slot_count_bounds() {
        assert!(ClientConfig::default().with_max_concurrent_requests(0).validate().is_err());
        assert!(
            ClientConfig::default()
                .with_max_concurrent_requests(u32::MAX)
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::default()
                .with_max_concurrent_requests(u32::MAX - 1)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn zero_tick_is_rejected() {
        let config = ClientConfig::default().with_keepalive_tick(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_content = r#"
max_concurrent_requests = 64

[keepalive]
timeout_ms = 500
"#;
        let config: ClientConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.max_concurrent_requests, 64);
        assert_eq!(config.keepalive.timeout_ms, 500);
        assert_eq!(config.keepalive.idle_ms, 10_000);
        assert!(config.nodelay);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "server_addr = \"10.1.2.3:9000\"\nnodelay = false\n").unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.server_addr, "10.1.2.3:9000");
        assert!(!config.nodelay);
    }

    #[test]
    fn load_from_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = ClientConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(missing.contains("failed to read config"));

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent_requests = \"many\"\n").unwrap();
        let invalid = ClientConfig::load_from(&path).unwrap_err();
        assert!(invalid.contains("failed to parse config"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ClientConfig::default().with_max_concurrent_requests(12);
        let text = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn default_path_ends_with_config_toml() {
        let path = ClientConfig::default_path();
        assert!(path.ends_with("slotwire/config.toml"));
    }
}
