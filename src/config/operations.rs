//! Config loading, validation, and utility operations.

use super::model::Config;
use crate::error::{DlmError, Result};
use crate::lock::NodeId;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

impl Config {
    /// Config for `node_id` in a cluster of `members`, everything else default.
    pub fn for_node(node_id: NodeId, members: &[NodeId]) -> Self {
        Self {
            node_id,
            node_name: format!("node{}", node_id),
            cluster: members.to_vec(),
            ..Self::default()
        }
    }

    /// Load config from a YAML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully loaded and validated config
    /// * `Err(DlmError::UserError)` - Read error, parse error or validation failure
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            DlmError::UserError(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| DlmError::UserError(format!("failed to parse config YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DlmError::UserError(format!("failed to serialize config to YAML: {}", e)))
    }

    /// Validate config values and return error on invalid values.
    ///
    /// Validation rules:
    /// - `cluster` has no duplicates and contains `node_id` (when non-empty)
    /// - `master_wait_ms` must be positive
    /// - every `masters` entry names a cluster member
    pub fn validate(&self) -> Result<()> {
        let members = self.members();

        let unique: BTreeSet<NodeId> = self.cluster.iter().copied().collect();
        if unique.len() != self.cluster.len() {
            return Err(DlmError::UserError(
                "config validation failed: cluster lists a node more than once".to_string(),
            ));
        }

        if !members.contains(&self.node_id) {
            return Err(DlmError::UserError(format!(
                "config validation failed: node_id {} is not a member of cluster {:?}",
                self.node_id, members
            )));
        }

        if self.master_wait_ms == 0 {
            return Err(DlmError::UserError(
                "config validation failed: master_wait_ms must be greater than 0".to_string(),
            ));
        }

        for (resource, master) in &self.masters {
            if !members.contains(master) {
                return Err(DlmError::UserError(format!(
                    "config validation failed: master {} for '{}' is not a cluster member",
                    master, resource
                )));
            }
        }

        Ok(())
    }

    /// Cluster members in ascending order.
    pub fn members(&self) -> Vec<NodeId> {
        if self.cluster.is_empty() {
            return vec![self.node_id];
        }
        let mut members = self.cluster.clone();
        members.sort_unstable();
        members
    }

    pub fn master_wait(&self) -> Duration {
        Duration::from_millis(self.master_wait_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
