//! Remote-side conversion handler.
//!
//! For resources mastered elsewhere, a node keeps a shadow of each of its
//! own locks. A request marks the shadow pending, goes to the master once,
//! and parks the caller on a one-slot channel until the response arrives,
//! recovery reports the master dead, or the caller's timeout elapses.
//! Shadows only ever change in response to the master (or to recovery),
//! so a pending shadow refuses new requests with `ConversionInProgress`.

use super::{LocalNotification, LockManager, RequestKind};
use crate::error::{DlmError, Result};
use crate::events::EventAction;
use crate::lock::{ConversionOutcome, HolderId, LockFlags, NodeId};
use crate::mode::LockMode;
use crate::registry::locked;
use crate::wire::{
    ConversionRequest, ConversionResponse, ConversionStatus, FailureCode, Notification,
    NotificationKind,
};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, warn};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

pub(super) type ShadowKey = (String, HolderId);

/// What a shadow lock is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowState {
    Idle,
    Acquiring(LockMode),
    Converting(LockMode),
    Releasing,
}

impl ShadowState {
    pub fn pending_mode(self) -> Option<LockMode> {
        match self {
            ShadowState::Idle => None,
            ShadowState::Acquiring(mode) | ShadowState::Converting(mode) => Some(mode),
            ShadowState::Releasing => Some(LockMode::NoLock),
        }
    }
}

/// This node's private copy of one of its locks on a remote resource.
#[derive(Debug)]
pub(super) struct Shadow {
    pub(super) master: NodeId,
    pub(super) granted: LockMode,
    pub(super) state: ShadowState,
    /// Newest generation heard from a master about this lock.
    pub(super) generation: u32,
    pub(super) blocking: Option<LockMode>,
    /// The master died and no replacement has taken the lock over yet.
    pub(super) orphaned: bool,
    /// The caller parked on the outstanding request, if it is still waiting.
    pub(super) waiter: Option<Sender<Result<ConversionOutcome>>>,
}

impl Shadow {
    fn new(master: NodeId) -> Self {
        Self {
            master,
            granted: LockMode::NoLock,
            state: ShadowState::Idle,
            generation: 0,
            blocking: None,
            orphaned: false,
            waiter: None,
        }
    }

    /// Give up the pending request. Returns `true` if the shadow should be
    /// dropped (an acquire that never got a grant).
    pub(super) fn revert(&mut self) -> bool {
        let drop_it = matches!(self.state, ShadowState::Acquiring(_));
        self.state = ShadowState::Idle;
        drop_it
    }
}

/// Serializable view of a shadow lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowView {
    pub resource: String,
    pub holder: HolderId,
    pub master: NodeId,
    pub granted: LockMode,
    pub state: ShadowState,
    pub generation: u32,
    pub orphaned: bool,
}

impl LockManager {
    /// Every shadow lock on this node, ordered by resource then holder.
    pub fn shadows(&self) -> Vec<ShadowView> {
        let mut views: Vec<ShadowView> = locked(&self.shadows)
            .iter()
            .map(|((resource, holder), shadow)| ShadowView {
                resource: resource.clone(),
                holder: *holder,
                master: shadow.master,
                granted: shadow.granted,
                state: shadow.state,
                generation: shadow.generation,
                orphaned: shadow.orphaned,
            })
            .collect();
        views.sort_by(|a, b| (&a.resource, a.holder).cmp(&(&b.resource, b.holder)));
        views
    }

    /// Send one request to `master` and wait for its answer.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn remote_call(
        &self,
        kind: RequestKind,
        master: NodeId,
        resource: &str,
        holder: HolderId,
        mode: LockMode,
        flags: LockFlags,
        timeout: Option<Duration>,
    ) -> Result<ConversionOutcome> {
        let key: ShadowKey = (resource.to_string(), holder);
        let (request, reply) = {
            let mut shadows = locked(&self.shadows);
            let (current_mode, generation) = match (kind, shadows.get(&key)) {
                (RequestKind::Acquire, Some(_)) => {
                    return Err(DlmError::AlreadyHolder {
                        resource: resource.to_string(),
                        holder: holder.to_string(),
                    });
                }
                (RequestKind::Acquire, None) => (LockMode::NoLock, 0),
                (_, None) => {
                    return Err(DlmError::NotHolder {
                        resource: resource.to_string(),
                        holder: holder.to_string(),
                    });
                }
                (_, Some(shadow)) if shadow.state != ShadowState::Idle => {
                    return Err(DlmError::ConversionInProgress {
                        resource: resource.to_string(),
                        holder: holder.to_string(),
                    });
                }
                (RequestKind::Convert, Some(shadow)) if shadow.granted == mode => {
                    return Ok(ConversionOutcome::Granted(mode));
                }
                (_, Some(shadow)) => (shadow.granted, shadow.generation),
            };

            let (tx, rx) = bounded(1);
            let shadow = shadows
                .entry(key.clone())
                .or_insert_with(|| Shadow::new(master));
            shadow.master = master;
            shadow.state = match kind {
                RequestKind::Acquire => ShadowState::Acquiring(mode),
                RequestKind::Release => ShadowState::Releasing,
                _ => ShadowState::Converting(mode),
            };
            shadow.waiter = Some(tx);

            let request = ConversionRequest {
                resource_name: resource.to_string(),
                holder,
                current_mode,
                requested_mode: mode,
                flags,
                generation,
            };
            (request, rx)
        };

        if let Err(e) = self
            .dispatcher
            .send(self.node, master, &kind.into_message(request))
        {
            warn!(
                "node {}: {:?} on {} could not reach master {}: {}",
                self.node, kind, resource, master, e
            );
            let mut shadows = locked(&self.shadows);
            if let Some(shadow) = shadows.get_mut(&key) {
                shadow.waiter = None;
                if shadow.revert() {
                    shadows.remove(&key);
                }
            }
            return Err(DlmError::MasterUnreachable {
                resource: resource.to_string(),
                master,
            });
        }

        let waited = match timeout.or_else(|| self.config.default_timeout()) {
            Some(limit) => reply
                .recv_timeout(limit)
                .map_err(|e| matches!(e, RecvTimeoutError::Timeout)),
            None => reply.recv().map_err(|_| false),
        };
        match waited {
            Ok(result) => result,
            Err(timed_out) => {
                // Whatever the master says from now on is applied unsolicited.
                if let Some(shadow) = locked(&self.shadows).get_mut(&key) {
                    shadow.waiter = None;
                }
                if let Ok(result) = reply.try_recv() {
                    return result;
                }
                if timed_out {
                    debug!("node {}: {:?} on {} timed out", self.node, kind, resource);
                    Err(DlmError::Timeout(resource.to_string()))
                } else {
                    Err(DlmError::RetryMaster(resource.to_string()))
                }
            }
        }
    }

    /// Ask `master` to abandon the holder's pending request.
    pub(super) fn cancel_remote(
        &self,
        master: NodeId,
        resource: &str,
        holder: HolderId,
    ) -> Result<()> {
        let request = {
            let shadows = locked(&self.shadows);
            let Some(shadow) = shadows.get(&(resource.to_string(), holder)) else {
                return Err(DlmError::NotHolder {
                    resource: resource.to_string(),
                    holder: holder.to_string(),
                });
            };
            let requested_mode = match shadow.state {
                ShadowState::Acquiring(mode) | ShadowState::Converting(mode) => mode,
                ShadowState::Idle | ShadowState::Releasing => return Ok(()),
            };
            ConversionRequest {
                resource_name: resource.to_string(),
                holder,
                current_mode: shadow.granted,
                requested_mode,
                flags: LockFlags {
                    cancel_requested: true,
                    ..LockFlags::default()
                },
                generation: shadow.generation,
            }
        };

        self.dispatcher
            .send(self.node, master, &RequestKind::Cancel.into_message(request))
            .map_err(|_| DlmError::MasterUnreachable {
                resource: resource.to_string(),
                master,
            })
    }

    /// Whether a message at `generation` predates what the shadow already
    /// knows. Stale messages are logged and dropped.
    fn is_stale(
        &self,
        from: NodeId,
        resource: &str,
        shadow_generation: u32,
        generation: u32,
    ) -> bool {
        if generation >= shadow_generation {
            return false;
        }
        let err = DlmError::StaleGeneration {
            resource: resource.to_string(),
            got: generation,
            current: shadow_generation,
        };
        warn!("node {}: dropping message from node {}: {}", self.node, from, err);
        self.events.record(
            self.events
                .event(EventAction::StaleDropped)
                .with_resource(resource)
                .with_details(json!({
                    "from": from,
                    "got": generation,
                    "current": shadow_generation,
                })),
        );
        true
    }

    /// Apply the master's answer to a request from this node.
    pub(super) fn apply_response(&self, from: NodeId, response: ConversionResponse) {
        let key: ShadowKey = (response.resource_name.clone(), response.holder);
        let mut shadows = locked(&self.shadows);
        let Some(shadow) = shadows.get_mut(&key) else {
            debug!(
                "node {}: response for unknown shadow {} on {}",
                self.node, response.holder, response.resource_name
            );
            return;
        };
        if self.is_stale(
            from,
            &response.resource_name,
            shadow.generation,
            response.generation,
        ) {
            return;
        }
        shadow.generation = response.generation;

        let name = &response.resource_name;
        let (result, remove) = match response.status {
            ConversionStatus::Granted if shadow.state == ShadowState::Releasing => {
                (Ok(ConversionOutcome::Granted(LockMode::NoLock)), true)
            }
            ConversionStatus::Granted => {
                if shadow.granted != response.mode {
                    shadow.blocking = None;
                }
                shadow.granted = response.mode;
                shadow.state = ShadowState::Idle;
                (Ok(ConversionOutcome::Granted(response.mode)), false)
            }
            ConversionStatus::Queued => (Ok(ConversionOutcome::Queued), false),
            ConversionStatus::Denied => (Ok(ConversionOutcome::Denied), shadow.revert()),
            ConversionStatus::RetryMaster => {
                (Err(DlmError::RetryMaster(name.clone())), shadow.revert())
            }
            // The master has no record of the lock being released.
            ConversionStatus::Failed(FailureCode::NotHolder)
                if shadow.state == ShadowState::Releasing =>
            {
                (Ok(ConversionOutcome::Granted(LockMode::NoLock)), true)
            }
            ConversionStatus::Failed(code) => {
                (Err(code.into_error(name, response.holder)), shadow.revert())
            }
        };

        match shadow.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(
                "node {}: applied unsolicited {:?} for {} on {}",
                self.node, response.status, response.holder, name
            ),
        }
        if remove {
            shadows.remove(&key);
        }
    }

    /// Apply an asynchronous grant, denial or blocking notice from a master.
    pub(super) fn apply_notification(&self, from: NodeId, notification: Notification) {
        let key: ShadowKey = (notification.resource_name.clone(), notification.holder);
        {
            let mut shadows = locked(&self.shadows);
            let Some(shadow) = shadows.get_mut(&key) else {
                debug!(
                    "node {}: notification for unknown shadow {} on {}",
                    self.node, notification.holder, notification.resource_name
                );
                return;
            };
            if self.is_stale(
                from,
                &notification.resource_name,
                shadow.generation,
                notification.generation,
            ) {
                return;
            }
            shadow.generation = notification.generation;

            let (result, remove) = match notification.kind {
                NotificationKind::Granted(mode) => {
                    if shadow.granted != mode {
                        shadow.blocking = None;
                    }
                    shadow.granted = mode;
                    shadow.state = ShadowState::Idle;
                    (Some(Ok(ConversionOutcome::Granted(mode))), false)
                }
                NotificationKind::Denied(mode) => {
                    let remove = shadow.revert();
                    shadow.granted = mode;
                    (Some(Ok(ConversionOutcome::Denied)), remove)
                }
                NotificationKind::Blocking(mode) => {
                    shadow.blocking = shadow.blocking.max(Some(mode));
                    (None, false)
                }
            };

            if let Some(result) = result
                && let Some(waiter) = shadow.waiter.take()
            {
                let _ = waiter.send(result);
            }
            if remove {
                shadows.remove(&key);
            }
        }

        self.notify_local(LocalNotification {
            resource: notification.resource_name,
            holder: notification.holder,
            kind: notification.kind,
        });
    }
}
