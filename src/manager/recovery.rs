//! Applying recovery coordinator events.
//!
//! The coordinator decides; this node only reacts. A `NodeDown` frees the
//! dead node's locks on resources mastered here and orphans this node's
//! shadows of resources the dead node mastered. A `MasterAssigned` names
//! the replacement master, which rebuilds the granted queue from the
//! survivors' `Recover` messages.

use super::LockManager;
use super::remote::ShadowState;
use crate::engine;
use crate::error::DlmError;
use crate::events::EventAction;
use crate::lock::{HolderId, LockFlags, NodeId};
use crate::mode::LockMode;
use crate::registry::locked;
use crate::wire::{ConversionRequest, Message};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;

/// An event from the recovery coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecoveryEvent {
    /// `node` left the cluster; `generation` supersedes everything before it.
    NodeDown { node: NodeId, generation: u32 },
    /// `master` now masters `resource`.
    MasterAssigned {
        resource: String,
        master: NodeId,
        generation: u32,
    },
}

impl LockManager {
    pub fn on_recovery_event(&self, event: RecoveryEvent) {
        match event {
            RecoveryEvent::NodeDown { node, generation } => self.node_down(node, generation),
            RecoveryEvent::MasterAssigned {
                resource,
                master,
                generation,
            } => self.master_assigned(&resource, master, generation),
        }
    }

    fn node_down(&self, dead: NodeId, generation: u32) {
        if dead == self.node {
            warn!("node {}: ignoring report of its own death", self.node);
            return;
        }
        self.generation.fetch_max(generation, Ordering::SeqCst);
        self.directory.mark_dead(dead);
        info!(
            "node {}: node {} down, generation {}",
            self.node, dead, generation
        );
        self.events.record(
            self.events
                .event(EventAction::NodeDown)
                .with_details(json!({"node": dead, "generation": generation})),
        );

        // Authoritative side: free the dead node's locks and let waiters in.
        let mut notices = Vec::new();
        let mut touched = Vec::new();
        for handle in self.registry.handles() {
            let mut res = locked(&handle);
            if !res.referencing_nodes().contains(&dead) {
                continue;
            }
            let freed = engine::purge_node(&mut res, dead);
            res.raise_generation(generation);
            let report = engine::process_queue(&mut res);
            notices.extend(self.notices_for(&res, report));
            self.events.record(
                self.events
                    .event(EventAction::Purge)
                    .with_resource(res.name())
                    .with_details(json!({"node": dead, "freed": freed})),
            );
            touched.push(res.name().to_string());
        }
        for name in touched {
            self.registry.remove_if_unused(&name);
        }
        self.deliver(notices);

        // Shadow side: pending requests to the dead master are abandoned.
        let mut shadows = locked(&self.shadows);
        shadows.retain(|(resource, holder), shadow| {
            if shadow.master != dead {
                return true;
            }
            shadow.generation = shadow.generation.max(generation);
            shadow.orphaned = true;
            let keep = !shadow.revert();
            if let Some(waiter) = shadow.waiter.take() {
                let _ = waiter.send(Err(DlmError::RetryMaster(resource.clone())));
            }
            if !keep {
                info!(
                    "node {}: dropped pending acquire of {} on {}",
                    self.node, holder, resource
                );
            }
            keep
        });
    }

    fn master_assigned(&self, resource: &str, master: NodeId, generation: u32) {
        self.generation.fetch_max(generation, Ordering::SeqCst);
        info!(
            "node {}: node {} now masters {} (generation {})",
            self.node, master, resource, generation
        );
        self.events.record(
            self.events
                .event(EventAction::MasterAssigned)
                .with_resource(resource)
                .with_details(json!({"master": master, "generation": generation})),
        );

        // Survivors' shadows on this resource, with the mode each holds.
        // Null-mode grants are locks too and move with the rest.
        let survivors: Vec<(HolderId, LockMode)> = {
            let mut shadows = locked(&self.shadows);
            let keys: Vec<(String, HolderId)> = shadows
                .iter()
                .filter(|((name, _), shadow)| {
                    name == resource && shadow.state == ShadowState::Idle
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut survivors = Vec::with_capacity(keys.len());
            for key in keys {
                if master == self.node {
                    // Local holders become authoritative.
                    if let Some(shadow) = shadows.remove(&key) {
                        survivors.push((key.1, shadow.granted));
                    }
                } else if let Some(shadow) = shadows.get_mut(&key) {
                    shadow.master = master;
                    shadow.orphaned = false;
                    shadow.generation = shadow.generation.max(generation);
                    survivors.push((key.1, shadow.granted));
                }
            }
            survivors
        };

        if master == self.node {
            self.take_over(resource, generation, survivors);
        } else {
            for (holder, mode) in survivors {
                let request = ConversionRequest {
                    resource_name: resource.to_string(),
                    holder,
                    current_mode: mode,
                    requested_mode: mode,
                    flags: LockFlags::default(),
                    generation,
                };
                if let Err(e) = self
                    .dispatcher
                    .send(self.node, master, &Message::Recover(request))
                {
                    warn!(
                        "node {}: could not re-register {} on {} with node {}: {}",
                        self.node, holder, resource, master, e
                    );
                }
            }
        }

        // Last: a retried request must reach the new master after the
        // re-registrations above.
        self.directory.assign(resource, master);
    }

    /// Become master of `resource`, seeding it with this node's own locks.
    fn take_over(&self, resource: &str, generation: u32, mine: Vec<(HolderId, LockMode)>) {
        let handle = self.registry.get_or_create(resource, self.node, generation);
        let notices = {
            let mut res = locked(&handle);
            res.set_master(self.node);
            res.raise_generation(generation);
            for (holder, mode) in mine {
                if let Err(e) = engine::insert_recovered(&mut res, holder, mode) {
                    warn!("node {}: {}", self.node, e);
                }
            }
            let report = engine::process_queue(&mut res);
            self.notices_for(&res, report)
        };
        drop(handle);
        self.registry.remove_if_unused(resource);
        self.deliver(notices);
    }
}
