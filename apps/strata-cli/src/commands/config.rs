//! `config init|show` and `connections`.

use serde::Serialize;
use std::path::PathBuf;
use strata_sync::config::api_key_env_var;
use strata_sync::StrataConfig;

use super::Context;
use crate::error::CliError;

const MASK: &str = "********";

/// Writes a default `strata.toml`.
pub fn init(config_path: Option<PathBuf>, force: bool) -> Result<(), CliError> {
    let path = config_path
        .or_else(StrataConfig::default_config_path)
        .ok_or_else(|| CliError::invalid_input("No config path available; pass --config"))?;

    if path.exists() && !force {
        return Err(CliError::invalid_input(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    StrataConfig::default().save(Some(path.clone()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Prints the effective configuration with API keys masked.
pub fn show(ctx: &Context) -> Result<(), CliError> {
    let mut config = ctx.config.clone();
    for connection in config.connections.values_mut() {
        if connection.api_key.is_some() {
            connection.api_key = Some(MASK.to_string());
        }
    }
    ctx.emit(&config, |config| {
        println!("database: {}", ctx.config.database_path().display());
        println!(
            "sync:     max_batch_size={} claim_lease_secs={} mark_clean={}",
            config.sync.max_batch_size, config.sync.claim_lease_secs, config.sync.mark_clean
        );
        println!(
            "retry:    max_attempts={} initial_backoff_ms={} max_backoff_secs={}",
            config.retry.max_attempts, config.retry.initial_backoff_ms, config.retry.max_backoff_secs
        );
        for (name, connection) in &config.connections {
            println!(
                "[{}] service={} base_url={} api_key={}",
                name,
                connection.service,
                connection.base_url.as_deref().unwrap_or("-"),
                connection.api_key.as_deref().unwrap_or("-"),
            );
        }
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionSummary {
    name: String,
    service: String,
    registered: bool,
    has_api_key: bool,
    api_key_env: String,
}

/// Lists configured connections and whether their service is known.
pub fn connections(ctx: &Context) -> Result<(), CliError> {
    let services = ctx.registry.services();
    let summaries: Vec<ConnectionSummary> = ctx
        .config
        .connections
        .iter()
        .map(|(name, connection)| ConnectionSummary {
            name: name.clone(),
            service: connection.service.clone(),
            registered: services.contains(&connection.service),
            has_api_key: connection.api_key.is_some(),
            api_key_env: api_key_env_var(name),
        })
        .collect();

    ctx.emit(&summaries, |summaries| {
        if summaries.is_empty() {
            println!("No connections configured. Add a [connections.<name>] section to strata.toml.");
        }
        for s in summaries {
            println!(
                "{:<16} {:<10} {}{}",
                s.name,
                s.service,
                if s.has_api_key { "key set" } else { "no key" },
                if s.registered { "" } else { " (unknown service)" },
            );
        }
    })
}
