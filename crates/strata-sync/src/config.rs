//! # Strata Configuration
//!
//! Configuration for the snapshot store, push behaviour, caller retries and
//! named connections.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STRATA_DB_PATH=/data/snapshots.db                                  │
//! │     STRATA_MAX_BATCH_SIZE=50                                           │
//! │     STRATA_CLAIM_LEASE_SECS=300                                        │
//! │     STRATA_<NAME>_API_KEY=...      (per connection)                    │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/snapshots/strata.toml (Linux)                            │
//! │     ~/Library/Application Support/com.strata.snapshots/strata.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/data/snapshots.db"
//! max_connections = 5
//!
//! [sync]
//! max_batch_size = 100
//! claim_lease_secs = 600
//! mark_clean = true
//!
//! [retry]
//! max_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_secs = 60
//!
//! [connections.blog]
//! service = "json_api"
//! base_url = "https://blog.example.com/api"
//! api_key = "..."
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use strata_db::DbConfig;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Where the snapshot store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `snapshots.db` in the data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Push behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Upper bound on a push batch; a connector's own batch size is capped
    /// by it.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Seconds after which another worker may take over a push claim.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,

    /// Clear edits after a successful push.
    #[serde(default = "default_true")]
    pub mark_clean: bool,
}

fn default_max_batch_size() -> usize {
    strata_core::MAX_PUSH_BATCH_SIZE
}

fn default_claim_lease() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_batch_size: default_max_batch_size(),
            claim_lease_secs: default_claim_lease(),
            mark_clean: true,
        }
    }
}

impl SyncSettings {
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Caller-side retry policy (the engine itself never retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl RetrySettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// One named connection to an external service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registry key of the connector (`memory`, `json_api`, ...).
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Connector-specific options.
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

impl ConnectionConfig {
    pub fn new(service: impl Into<String>) -> Self {
        ConnectionConfig {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Integer setting, if present and a non-negative integer.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(Value::as_u64)
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl StrataConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (strata.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_batch_size must be greater than 0".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        for (name, connection) in &self.connections {
            if connection.service.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "connections.{}.service is empty",
                    name
                )));
            }
            if let Some(base_url) = &connection.base_url {
                let parsed = url::Url::parse(base_url)?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(SyncError::InvalidUrl(format!(
                        "connections.{}.base_url must be http(s), got: {}",
                        name, base_url
                    )));
                }
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STRATA_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(size) = std::env::var("STRATA_MAX_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.sync.max_batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid STRATA_MAX_BATCH_SIZE"),
            }
        }

        if let Ok(lease) = std::env::var("STRATA_CLAIM_LEASE_SECS") {
            match lease.parse::<u64>() {
                Ok(n) => self.sync.claim_lease_secs = n,
                Err(_) => warn!(value = %lease, "Ignoring invalid STRATA_CLAIM_LEASE_SECS"),
            }
        }

        for (name, connection) in self.connections.iter_mut() {
            if let Ok(key) = std::env::var(api_key_env_var(name)) {
                debug!(connection = %name, "Overriding API key from environment");
                connection.api_key = Some(key);
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("strata.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Database file to open.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("snapshots.db")))
            .unwrap_or_else(|| PathBuf::from("snapshots.db"))
    }

    /// Store configuration derived from `[database]`.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database_path()).max_connections(self.database.max_connections)
    }

    /// Looks up a named connection.
    pub fn connection(&self, name: &str) -> SyncResult<&ConnectionConfig> {
        self.connections.get(name).ok_or_else(|| {
            SyncError::InvalidConfig(format!("no [connections.{}] section", name))
        })
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "strata", "snapshots")
}

/// `STRATA_<NAME>_API_KEY` for a connection name.
pub fn api_key_env_var(connection: &str) -> String {
    let name: String = connection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("STRATA_{}_API_KEY", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.sync.max_batch_size, 100);
        assert_eq!(config.sync.claim_lease_secs, 600);
        assert!(config.sync.mark_clean);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: StrataConfig = toml::from_str(
            r#"
            [sync]
            max_batch_size = 25

            [connections.blog]
            service = "json_api"
            base_url = "https://blog.example.com/api"

            [connections.blog.settings]
            page_size = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.max_batch_size, 25);
        assert_eq!(config.retry.max_attempts, 5);
        let blog = config.connection("blog").unwrap();
        assert_eq!(blog.service, "json_api");
        assert_eq!(blog.setting_u64("page_size"), Some(50));
        assert!(config.connection("shop").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = StrataConfig::default();
        config.sync.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let mut config = StrataConfig::default();
        config.connections.insert(
            "blog".into(),
            ConnectionConfig::new("json_api").with_base_url("not a url"),
        );
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.connections.insert(
            "blog".into(),
            ConnectionConfig::new("json_api").with_base_url("ftp://example.com"),
        );
        assert!(config.validate().unwrap_err().is_config_error());

        config.connections.insert(
            "blog".into(),
            ConnectionConfig::new("json_api").with_base_url("https://example.com"),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_key_env_var_name() {
        assert_eq!(api_key_env_var("blog"), "STRATA_BLOG_API_KEY");
        assert_eq!(api_key_env_var("my-shop"), "STRATA_MY_SHOP_API_KEY");
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let mut config = StrataConfig::default();
        config
            .connections
            .insert("demo".into(), ConnectionConfig::new("memory"));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[connections.demo]"));
    }
}
