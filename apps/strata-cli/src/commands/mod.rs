//! # Subcommands
//!
//! Each module holds the handlers for one group of subcommands. Handlers
//! share a [`Context`] carrying the loaded configuration and the connector
//! registry.

pub mod config;
pub mod pull;
pub mod push;
pub mod records;
pub mod tables;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use strata_db::Database;
use strata_sync::{Connector, ConnectorRegistry, StrataConfig, SyncEngine, SyncError};
use tracing::debug;

use crate::error::{CliError, ErrorCode};

/// State shared by every subcommand.
pub struct Context {
    pub config: StrataConfig,
    pub registry: ConnectorRegistry,
    pub json: bool,
}

impl Context {
    /// Loads `strata.toml` (plus env overrides) and the built-in connectors.
    pub fn load(config_path: Option<PathBuf>, json: bool) -> Result<Self, CliError> {
        let config = StrataConfig::load(config_path)?;
        Ok(Context {
            config,
            registry: ConnectorRegistry::with_builtins(),
            json,
        })
    }

    /// Opens the snapshot store and wraps it in an engine.
    pub async fn engine(&self) -> Result<SyncEngine, CliError> {
        let db_config = self.config.db_config();
        debug!(path = ?self.config.database_path(), "Opening snapshot store");
        let db = Database::new(db_config).await?;
        Ok(SyncEngine::new(db, self.config.sync.clone()))
    }

    /// Builds the connector for a named connection.
    pub fn connector(&self, name: &str) -> Result<Arc<dyn Connector>, CliError> {
        let connection = self.config.connection(name)?;
        self.registry
            .create(connection)
            .map_err(|e| CliError::from(SyncError::connector(name, e)))
    }

    /// Prints `value` as pretty JSON with `--json`, otherwise runs `text`.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<(), CliError> {
        if self.json {
            let body = serde_json::to_string_pretty(value).map_err(|e| {
                CliError::new(ErrorCode::Internal, "Could not encode output").with_description(e.to_string())
            })?;
            println!("{}", body);
        } else {
            text(value);
        }
        Ok(())
    }
}

/// Parses a JSON argument; `@path` reads the JSON from a file.
pub fn parse_json_arg<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T, CliError> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            CliError::invalid_input(format!("Cannot read {} file {}", what, path))
                .with_description(e.to_string())
        })?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| {
        CliError::invalid_input(format!("Invalid JSON for {}", what)).with_description(e.to_string())
    })
}
