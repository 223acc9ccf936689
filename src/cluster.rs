//! In-process cluster: one [`LockManager`] per node on a shared
//! [`LocalNetwork`], each with its own pump thread.

use crate::config::Config;
use crate::dispatch::LocalNetwork;
use crate::error::{DlmError, Result};
use crate::lock::NodeId;
use crate::manager::{LockManager, RecoveryEvent};
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    nodes: BTreeMap<NodeId, Arc<LockManager>>,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start every node of `members` with default config.
    pub fn start(members: &[NodeId]) -> Result<Self> {
        Self::start_with(members, |_| {})
    }

    /// Start every node of `members`, letting `tweak` adjust each node's
    /// config before its manager is built.
    pub fn start_with(members: &[NodeId], tweak: impl Fn(&mut Config)) -> Result<Self> {
        if members.is_empty() {
            return Err(DlmError::UserError("cluster has no members".to_string()));
        }
        let network = LocalNetwork::new();
        let mut cluster = Self {
            network: network.clone(),
            nodes: BTreeMap::new(),
            pumps: Vec::new(),
        };
        for &node in members {
            let mut config = Config::for_node(node, members);
            tweak(&mut config);
            let manager = LockManager::new(config, network.clone())?;
            cluster.pumps.push(network.attach(node, manager.clone())?);
            cluster.nodes.insert(node, manager);
        }
        debug!("cluster: started nodes {:?}", members);
        Ok(cluster)
    }

    pub fn node(&self, id: NodeId) -> Result<&Arc<LockManager>> {
        self.nodes
            .get(&id)
            .ok_or_else(|| DlmError::UserError(format!("no node {} in the cluster", id)))
    }

    /// Live node ids, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.network.is_connected(*id))
            .collect()
    }

    /// Cut `node` off the network. Its manager keeps running, but nothing it
    /// sends arrives anywhere.
    pub fn kill(&self, node: NodeId) {
        self.network.disconnect(node);
    }

    /// Deliver a recovery event to every live node. A newly assigned master
    /// hears about its assignment first.
    pub fn recover(&self, event: RecoveryEvent) {
        let mut order = self.node_ids();
        if let RecoveryEvent::MasterAssigned { master, .. } = &event {
            order.sort_by_key(|id| id != master);
        }
        for id in order {
            if let Some(node) = self.nodes.get(&id) {
                node.on_recovery_event(event.clone());
            }
        }
    }

    /// Wait for every message in flight to be handled.
    pub fn settle(&self, limit: Duration) -> Result<()> {
        if self.network.wait_idle(limit) {
            Ok(())
        } else {
            Err(DlmError::Timeout("cluster did not settle".to_string()))
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for id in self.nodes.keys() {
            self.network.disconnect(*id);
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
    }
}
