//! Typed view of the merged configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{secrets, LoadedConfig};

/// `reconcile:` section. Values stamped on notifications and the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// Activity tag for requests that carry none.
    pub activity: String,
    /// Identifies this reconciler on notifications (`tool-id`).
    pub tool_id: String,
    /// Failed attempts beyond this many retries are not requeued.
    pub max_retries: u32,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            activity: "default".to_string(),
            tool_id: "conveyor".to_string(),
            max_retries: 3,
        }
    }
}

/// `transfer_tool:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferToolSection {
    /// REST base URL; also the base of `reason-link` on notifications.
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for TransferToolSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: 30,
        }
    }
}

/// `daemon:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Requests fetched per poll.
    pub batch_size: usize,
    /// Concurrent reconciliations per poll.
    pub max_in_flight: usize,
    pub poll_interval_secs: u64,
    /// Hold-back for requests that cannot settle without intervention
    /// (unknown RSE, missing DID, unreadable transfer report).
    pub defer_secs: u64,
    pub migrate_on_start: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_in_flight: 8,
            poll_interval_secs: 30,
            defer_secs: 3600,
            migrate_on_start: false,
        }
    }
}

/// `database:` section. Holds the NAME of the env var with the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url_env: "CONVEYOR_DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub reconcile: ReconcileSection,
    pub transfer_tool: TransferToolSection,
    pub daemon: DaemonSection,
    pub database: DatabaseSection,
}

impl ConveyorConfig {
    /// Deserialize and validate. Missing sections and keys take defaults.
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg: ConveyorConfig = serde_json::from_value(loaded.config_json.clone())
            .context("CONFIG_INVALID: config does not match the expected shape")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_tool.endpoint.trim().is_empty() {
            bail!("CONFIG_INVALID: transfer_tool.endpoint must be set");
        }
        if self.daemon.batch_size == 0 {
            bail!("CONFIG_INVALID: daemon.batch_size must be >= 1");
        }
        if self.daemon.max_in_flight == 0 {
            bail!("CONFIG_INVALID: daemon.max_in_flight must be >= 1");
        }
        if self.daemon.poll_interval_secs == 0 {
            bail!("CONFIG_INVALID: daemon.poll_interval_secs must be >= 1");
        }
        if self.database.max_connections == 0 {
            bail!("CONFIG_INVALID: database.max_connections must be >= 1");
        }
        Ok(())
    }

    /// Database URL from the env var named by `database.url_env`.
    pub fn database_url(&self) -> Result<String> {
        secrets::resolve_env_required(&self.database.url_env, "database url")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_layered_yaml_from_strings;

    #[test]
    fn defaults_fill_missing_sections() {
        let loaded = load_layered_yaml_from_strings(&["transfer_tool:\n  endpoint: https://fts.example:8446\n"])
            .unwrap();
        let cfg = ConveyorConfig::from_loaded(&loaded).unwrap();
        assert_eq!(cfg.reconcile.max_retries, 3);
        assert_eq!(cfg.daemon.max_in_flight, 8);
        assert_eq!(cfg.database.url_env, "CONVEYOR_DATABASE_URL");
    }

    #[test]
    fn missing_endpoint_rejected() {
        let loaded = load_layered_yaml_from_strings(&["daemon:\n  batch_size: 5\n"]).unwrap();
        let err = ConveyorConfig::from_loaded(&loaded).unwrap_err();
        assert!(err.to_string().contains("transfer_tool.endpoint"));
    }

    #[test]
    fn consumed_registry_matches_typed_fields() {
        let mut leaves = Vec::new();
        crate::collect_leaf_pointers(
            &serde_json::to_value(ConveyorConfig::default()).unwrap(),
            "",
            &mut leaves,
        );
        leaves.sort();
        let mut registry: Vec<String> = crate::CONSUMED_POINTERS.iter().map(|p| p.to_string()).collect();
        registry.sort();
        assert_eq!(leaves, registry);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = ConveyorConfig::default();
        cfg.transfer_tool.endpoint = "https://fts.example".into();
        cfg.daemon.max_in_flight = 0;
        assert!(cfg.validate().is_err());
    }
}
