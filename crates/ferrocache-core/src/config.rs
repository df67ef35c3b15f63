//! Node configuration

use crate::version::NodeId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default minimum interval between two protocol switches
pub const DEFAULT_SWITCH_COOL_DOWN: Duration = Duration::from_secs(60);

/// Strategy used to validate transactions delivered in total order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStrategy {
    /// Validate on the delivery thread, strictly in delivery order
    Sequential,
    /// Validate on a worker pool, ordering only conflicting transactions
    Parallel,
}

impl Default for ValidationStrategy {
    fn default() -> Self {
        Self::Parallel
    }
}

/// Ferrocache node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// This node's identity, used in versions and transaction ids
    pub node_id: NodeId,

    /// Protocol active at epoch 0
    pub default_protocol: String,

    /// Minimum interval between two protocol switches
    pub switch_cool_down: Duration,

    /// Total order validation strategy
    pub total_order_validation: ValidationStrategy,

    /// Worker threads for parallel validation
    pub validation_workers: usize,

    /// Register read-set keys as dependencies in parallel validation
    pub read_set_dependencies: bool,

    /// Timeout for synchronous remote calls
    pub remote_timeout: Duration,

    /// Committed batches kept in the commit log history
    pub commit_log_history: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            default_protocol: "2PC".to_string(),
            switch_cool_down: DEFAULT_SWITCH_COOL_DOWN,
            total_order_validation: ValidationStrategy::Parallel,
            validation_workers: 4,
            read_set_dependencies: true,
            remote_timeout: Duration::from_secs(10),
            commit_log_history: 1024,
        }
    }
}

impl CoreConfig {
    /// Create a configuration for the given node
    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Load and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))?;
        config.validate().map_err(Error::config)?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Set the protocol active at epoch 0
    pub fn with_default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = protocol.into();
        self
    }

    /// Set the switch cool-down
    pub fn with_switch_cool_down(mut self, cool_down: Duration) -> Self {
        self.switch_cool_down = cool_down;
        self
    }

    /// Set the total order validation strategy
    pub fn with_validation(mut self, strategy: ValidationStrategy) -> Self {
        self.total_order_validation = strategy;
        self
    }

    /// Set the parallel validation pool size
    pub fn with_validation_workers(mut self, workers: usize) -> Self {
        self.validation_workers = workers;
        self
    }

    /// Enable/disable read-set dependency tracking
    pub fn with_read_set_dependencies(mut self, enabled: bool) -> Self {
        self.read_set_dependencies = enabled;
        self
    }

    /// Set the remote call timeout
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_protocol.is_empty() {
            return Err("default_protocol must not be empty".into());
        }

        if self.total_order_validation == ValidationStrategy::Parallel
            && self.validation_workers == 0
        {
            return Err("validation_workers must be at least 1".into());
        }

        if self.remote_timeout.is_zero() {
            return Err("remote_timeout must be positive".into());
        }

        if self.commit_log_history == 0 {
            return Err("commit_log_history must be at least 1".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.default_protocol, "2PC");
        assert_eq!(config.switch_cool_down, Duration::from_secs(60));
        assert_eq!(config.total_order_validation, ValidationStrategy::Parallel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CoreConfig::for_node(3)
            .with_default_protocol("TO")
            .with_validation(ValidationStrategy::Sequential)
            .with_switch_cool_down(Duration::ZERO);
        assert_eq!(config.node_id, 3);
        assert_eq!(config.default_protocol, "TO");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parallel_without_workers() {
        let config = CoreConfig::default().with_validation_workers(0);
        assert!(config.validate().is_err());

        let sequential = config.with_validation(ValidationStrategy::Sequential);
        assert!(sequential.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = CoreConfig::from_json(r#"{"node_id": 7, "default_protocol": "PB"}"#).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.default_protocol, "PB");
        assert_eq!(config.validation_workers, 4);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = CoreConfig::from_json(r#"{"default_protocol": ""}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = CoreConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferrocache.json");
        std::fs::write(&path, r#"{"node_id": 2, "total_order_validation": "Sequential"}"#).unwrap();

        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.total_order_validation, ValidationStrategy::Sequential);

        let missing = CoreConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, Error::Config(_)));
    }
}
