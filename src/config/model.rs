//! Config struct definition and default implementation.

use super::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration for one lock manager node.
///
/// Unknown fields in the YAML are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // =========================================================================
    // Identity
    // =========================================================================
    /// This node's number.
    #[serde(default = "default_node_id")]
    pub node_id: u32,

    /// Human-readable name used in the event log (default: host name).
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Every node of the cluster, this one included. Empty means a
    /// single-node cluster of `node_id`.
    #[serde(default)]
    pub cluster: Vec<u32>,

    // =========================================================================
    // Mastery
    // =========================================================================
    /// Resources whose master is fixed rather than hashed over `cluster`.
    #[serde(default)]
    pub masters: BTreeMap<String, u32>,

    /// How long a request waits for a replacement master after the current
    /// one is reported down, before failing with `MasterUnreachable`.
    #[serde(default = "default_master_wait_ms")]
    pub master_wait_ms: u64,

    // =========================================================================
    // Requests
    // =========================================================================
    /// Deadline applied to remote requests when the caller passes none.
    /// Unset means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,

    // =========================================================================
    // Audit
    // =========================================================================
    /// NDJSON file receiving one line per lock transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node_name: default_node_name(),
            cluster: Vec::new(),
            masters: BTreeMap::new(),
            master_wait_ms: default_master_wait_ms(),
            default_timeout_ms: None,
            event_log: None,
        }
    }
}
