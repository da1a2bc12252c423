//! Configuration for the change feed.

use crate::error::{ChangeError, Result};
use crate::handlers::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which storage backend to use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaConfig {
    /// Process-lifetime maps, nothing persisted.
    Memory,

    /// Maps persisted as a snapshot file rewritten on every mutation.
    File {
        path: PathBuf,

        /// Whether to create the snapshot if it doesn't exist.
        #[serde(default = "default_create_if_missing")]
        create_if_missing: bool,
    },

    /// SQLite database (`None` = in-memory database).
    Sql {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for MetaConfig {
    fn default() -> Self {
        MetaConfig::Memory
    }
}

fn default_create_if_missing() -> bool {
    true
}

/// Change feed configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangefeedConfig {
    /// Storage backend.
    pub meta: MetaConfig,

    /// Queue capacity of each live handler.
    /// Default: 100
    pub handler_queue_capacity: usize,
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            meta: MetaConfig::default(),
            handler_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ChangefeedConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ChangeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.handler_queue_capacity == 0 {
            return Err(ChangeError::InvalidConfig(
                "handler_queue_capacity must be at least 1".into(),
            ));
        }
        if let MetaConfig::File { path, .. } = &self.meta {
            if path.as_os_str().is_empty() {
                return Err(ChangeError::InvalidConfig("file backend requires a path".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChangefeedConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ChangefeedConfig::default());
        assert_eq!(config.handler_queue_capacity, 100);
        assert_eq!(config.meta, MetaConfig::Memory);
    }

    #[test]
    fn test_file_backend() {
        let config = ChangefeedConfig::from_json_str(
            r#"{"meta": {"type": "file", "path": "/var/lib/changes.snapshot"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.meta,
            MetaConfig::File {
                path: PathBuf::from("/var/lib/changes.snapshot"),
                create_if_missing: true,
            }
        );
    }

    #[test]
    fn test_sql_backend_in_memory() {
        let config =
            ChangefeedConfig::from_json_str(r#"{"meta": {"type": "sql"}, "handler_queue_capacity": 8}"#)
                .unwrap();
        assert_eq!(config.meta, MetaConfig::Sql { path: None });
        assert_eq!(config.handler_queue_capacity, 8);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = ChangefeedConfig::from_json_str(r#"{"handler_queue_capacity": 0}"#);
        assert!(matches!(result, Err(ChangeError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = ChangefeedConfig::from_json_str(r#"{"meta": {"type": "kafka"}}"#);
        assert!(matches!(result, Err(ChangeError::InvalidConfig(_))));
    }
}
