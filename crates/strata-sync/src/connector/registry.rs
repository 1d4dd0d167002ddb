//! # Connector Registry
//!
//! Maps a service name (`[connections.<name>].service`) to a factory that
//! builds the connector from its [`ConnectionConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_core::ConnectorError;
use tracing::debug;

use super::json_api::{self, JsonApiConnector};
use super::memory::{self, MemoryConnector, MemoryOptions};
use super::{Connector, ConnectorResult};
use crate::config::ConnectionConfig;

/// Builds a connector from its connection settings.
pub type ConnectorFactory =
    Arc<dyn Fn(&ConnectionConfig) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync>;

/// Service name → factory.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("services", &self.services())
            .finish()
    }
}

impl ConnectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `memory` and `json_api` connectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(memory::SERVICE_NAME, Arc::new(build_memory));
        registry.register(json_api::SERVICE_NAME, Arc::new(build_json_api));
        registry
    }

    /// Adds or replaces a factory.
    pub fn register(&mut self, service: impl Into<String>, factory: ConnectorFactory) {
        self.factories.insert(service.into(), factory);
    }

    /// Builds the connector for a connection.
    ///
    /// ## Errors
    /// `ConnectorError::Instantiation` for an unknown service or bad settings.
    pub fn create(&self, config: &ConnectionConfig) -> ConnectorResult<Arc<dyn Connector>> {
        let factory = self
            .factories
            .get(&config.service)
            .ok_or_else(|| ConnectorError::Instantiation {
                service: config.service.clone(),
                reason: format!(
                    "unknown service (available: {})",
                    self.services().join(", ")
                ),
            })?;
        debug!(service = %config.service, "Building connector");
        factory(config)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

fn build_memory(config: &ConnectionConfig) -> ConnectorResult<Arc<dyn Connector>> {
    let mut options = MemoryOptions::default();
    if let Some(size) = config.setting_u64("page_size") {
        options = options.page_size(size as usize);
    }
    if let Some(size) = config.setting_u64("batch_size") {
        options = options.batch_size(size as usize);
    }
    if let Some(ms) = config.setting_u64("latency_ms") {
        options = options.latency(Duration::from_millis(ms));
    }
    if let Some(n) = config.setting_u64("fail_after_batches") {
        options = options.fail_after_batches(n as usize);
    }

    let connector = match config.setting_str("fixture") {
        Some(path) => MemoryConnector::load_fixture(options, &PathBuf::from(path))?,
        None => MemoryConnector::new(options),
    };
    Ok(Arc::new(connector))
}

fn build_json_api(config: &ConnectionConfig) -> ConnectorResult<Arc<dyn Connector>> {
    Ok(Arc::new(JsonApiConnector::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_are_registered() {
        let registry = ConnectorRegistry::with_builtins();
        assert_eq!(registry.services(), vec!["json_api", "memory"]);

        let connector = registry
            .create(&ConnectionConfig::new("memory").with_setting("batch_size", json!(7)))
            .unwrap();
        assert_eq!(connector.service_name(), "memory");
        assert_eq!(connector.batch_size(strata_core::PushOperation::Update), 7);
    }

    #[test]
    fn test_unknown_service_fails_instantiation() {
        let registry = ConnectorRegistry::with_builtins();
        let err = registry.create(&ConnectionConfig::new("notion")).err().unwrap();
        match err {
            ConnectorError::Instantiation { service, reason } => {
                assert_eq!(service, "notion");
                assert!(reason.contains("memory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_fixture_fails_instantiation() {
        let registry = ConnectorRegistry::with_builtins();
        let config =
            ConnectionConfig::new("memory").with_setting("fixture", json!("/nonexistent/fixture.json"));
        assert!(matches!(
            registry.create(&config).err(),
            Some(ConnectorError::Instantiation { .. })
        ));
    }
}
