//! Resource mastery directory.
//!
//! Answers "which node masters this resource?" without any election: a
//! resource is mastered by the node its name hashes to over the cluster
//! members, unless the config pins it or the recovery coordinator has
//! assigned a replacement. The directory also remembers which nodes have
//! been reported down, and lets a caller wait a bounded time for a dead
//! master to be replaced.

use crate::error::{DlmError, Result};
use crate::lock::NodeId;
use crate::registry::locked;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct DirectoryState {
    assigned: HashMap<String, NodeId>,
    dead: BTreeSet<NodeId>,
}

#[derive(Debug)]
pub struct Directory {
    members: Vec<NodeId>,
    pinned: BTreeMap<String, NodeId>,
    state: Mutex<DirectoryState>,
    changed: Condvar,
}

/// FNV-1a: stable across processes and builds, unlike the std hasher.
fn name_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl Directory {
    /// `members` must be non-empty.
    pub fn new(members: Vec<NodeId>, pinned: BTreeMap<String, NodeId>) -> Self {
        Self {
            members,
            pinned,
            state: Mutex::new(DirectoryState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// The node currently responsible for `name`, dead or alive.
    pub fn master_of(&self, name: &str) -> NodeId {
        let state = locked(&self.state);
        self.master_in(&state, name)
    }

    fn master_in(&self, state: &DirectoryState, name: &str) -> NodeId {
        if let Some(node) = state.assigned.get(name) {
            return *node;
        }
        if let Some(node) = self.pinned.get(name) {
            return *node;
        }
        let slot = (name_hash(name) % self.members.len() as u64) as usize;
        self.members[slot]
    }

    /// Record a replacement master and wake anyone waiting for one.
    pub fn assign(&self, name: &str, master: NodeId) {
        locked(&self.state).assigned.insert(name.to_string(), master);
        self.changed.notify_all();
    }

    pub fn mark_dead(&self, node: NodeId) {
        locked(&self.state).dead.insert(node);
        self.changed.notify_all();
    }

    pub fn is_dead(&self, node: NodeId) -> bool {
        locked(&self.state).dead.contains(&node)
    }

    /// The master of `name`, waiting up to `window` for a replacement if the
    /// current one is dead.
    pub fn wait_for_live_master(&self, name: &str, window: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + window;
        let mut state = locked(&self.state);
        loop {
            let master = self.master_in(&state, name);
            if !state.dead.contains(&master) {
                return Ok(master);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DlmError::MasterUnreachable {
                    resource: name.to_string(),
                    master,
                });
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poison| poison.into_inner().0);
        }
    }
}
