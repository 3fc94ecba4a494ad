//! Persistence environment and configuration.

use entigraph_core::{
    AccessControl, AllowAll, DataSource, Definitions, EntityType, Result, SequenceGenerator,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Persist Configuration
// ============================================================================

/// Configuration for persist behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Whether audit records are written alongside the data.
    pub audit: bool,
    /// Whether unreferenced placeholders are swept after a successful persist.
    pub reclaim_after_persist: bool,
    /// Whether depends-on entities are validated against the database.
    pub validate_depends_on: bool,
    /// Maximum number of rows per write batch.
    pub max_batch_size: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            audit: true,
            reclaim_after_persist: false,
            validate_depends_on: true,
            max_batch_size: 500,
        }
    }
}

impl PersistConfig {
    /// Create new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn audit(mut self, value: bool) -> Self {
        self.audit = value;
        self
    }

    #[must_use]
    pub fn reclaim_after_persist(mut self, value: bool) -> Self {
        self.reclaim_after_persist = value;
        self
    }

    #[must_use]
    pub fn validate_depends_on(mut self, value: bool) -> Self {
        self.validate_depends_on = value;
        self
    }

    /// Set the batch size limit. Zero is treated as one.
    #[must_use]
    pub fn max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value.max(1);
        self
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Everything a context needs to reach the database.
#[derive(Clone)]
pub struct Environment {
    definitions: Arc<Definitions>,
    data_source: Arc<dyn DataSource>,
    sequences: Arc<dyn SequenceGenerator>,
    access: Arc<dyn AccessControl>,
    config: PersistConfig,
}

impl Environment {
    pub fn new(
        definitions: Arc<Definitions>,
        data_source: Arc<dyn DataSource>,
        sequences: Arc<dyn SequenceGenerator>,
    ) -> Self {
        Self {
            definitions,
            data_source,
            sequences,
            access: Arc::new(AllowAll),
            config: PersistConfig::default(),
        }
    }

    #[must_use]
    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definitions(&self) -> &Arc<Definitions> {
        &self.definitions
    }

    pub fn entity_type(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.definitions.get(name)
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    pub fn sequences(&self) -> &Arc<dyn SequenceGenerator> {
        &self.sequences
    }

    pub fn access_control(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("entity_types", &self.definitions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PersistConfig::default();
        assert!(config.audit);
        assert!(!config.reclaim_after_persist);
        assert!(config.validate_depends_on);
        assert_eq!(config.max_batch_size, 500);
    }

    #[test]
    fn test_config_builder() {
        let config = PersistConfig::new()
            .audit(false)
            .reclaim_after_persist(true)
            .max_batch_size(0);
        assert!(!config.audit);
        assert!(config.reclaim_after_persist);
        assert_eq!(config.max_batch_size, 1);
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = PersistConfig::from_json(r#"{"max_batch_size": 20}"#).unwrap();
        assert_eq!(config.max_batch_size, 20);
        assert!(config.audit);
        assert!(PersistConfig::from_json("not json").is_err());
    }
}
