//! Default values used by the Config struct.

/// Default node number for a single-node setup.
pub const DEFAULT_NODE_ID: u32 = 1;

/// Default window for a replacement master to appear after a master dies.
pub const DEFAULT_MASTER_WAIT_MS: u64 = 5_000;

pub(crate) fn default_node_id() -> u32 {
    DEFAULT_NODE_ID
}

pub(crate) fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub(crate) fn default_master_wait_ms() -> u64 {
    DEFAULT_MASTER_WAIT_MS
}
