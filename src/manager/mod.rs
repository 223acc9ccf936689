//! Per-node lock manager.
//!
//! [`LockManager`] is what callers on a node talk to. Each request names a
//! resource and a holder on this node; the manager routes it either to the
//! local master-side handler (when this node masters the resource) or over
//! the [`Dispatcher`] to the master, suspending the caller until the master
//! answers.
//!
//! The manager is also the node's [`MessageHandler`]: requests from other
//! nodes are served by the master side, responses and notifications update
//! local shadow locks. Recovery events enter through
//! [`LockManager::on_recovery_event`].
//!
//! # State
//!
//! Authoritative lock state lives in the [`Registry`] and only covers
//! resources this node masters. Shadow state (this node's view of its own
//! locks on resources mastered elsewhere) lives in a separate table and is
//! changed only by master responses, notifications and recovery.

mod master;
mod recovery;
mod remote;
#[cfg(test)]
mod tests;

pub use recovery::RecoveryEvent;
pub use remote::{ShadowState, ShadowView};

use crate::config::Config;
use crate::directory::Directory;
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::error::{DlmError, Result};
use crate::events::EventLog;
use crate::lock::{ConversionOutcome, HolderId, LockFlags, NodeId};
use crate::mode::LockMode;
use crate::registry::{Registry, locked};
use crate::resource::ResourceSnapshot;
use crate::wire::{
    ConversionRequest, ConversionResponse, ConversionStatus, Message, Notification,
    NotificationKind,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use remote::{Shadow, ShadowKey};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An asynchronous event concerning a holder on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNotification {
    pub resource: String,
    pub holder: HolderId,
    pub kind: NotificationKind,
}

/// What this node knows about one of its holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HolderState {
    pub granted: LockMode,
    /// Mode of an outstanding request, `NL` for a pending release.
    pub pending: Option<LockMode>,
    /// Highest mode another holder is waiting for behind this one.
    pub blocking: Option<LockMode>,
}

/// The request kinds a master serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Acquire,
    Convert,
    Cancel,
    Release,
    Recover,
}

impl RequestKind {
    fn into_message(self, request: ConversionRequest) -> Message {
        match self {
            RequestKind::Acquire => Message::Acquire(request),
            RequestKind::Convert => Message::Convert(request),
            RequestKind::Cancel => Message::Cancel(request),
            RequestKind::Release => Message::Release(request),
            RequestKind::Recover => Message::Recover(request),
        }
    }

    fn split(message: Message) -> Option<(Self, ConversionRequest)> {
        match message {
            Message::Acquire(r) => Some((RequestKind::Acquire, r)),
            Message::Convert(r) => Some((RequestKind::Convert, r)),
            Message::Cancel(r) => Some((RequestKind::Cancel, r)),
            Message::Release(r) => Some((RequestKind::Release, r)),
            Message::Recover(r) => Some((RequestKind::Recover, r)),
            Message::Response(_) | Message::Notify(_) => None,
        }
    }

    /// Cancel and Recover are fire-and-forget; the rest get a response.
    fn expects_response(self) -> bool {
        !matches!(self, RequestKind::Cancel | RequestKind::Recover)
    }
}

/// Translate a master's answer into what the caller sees.
fn outcome_of(response: &ConversionResponse) -> Result<ConversionOutcome> {
    match response.status {
        ConversionStatus::Granted => Ok(ConversionOutcome::Granted(response.mode)),
        ConversionStatus::Queued => Ok(ConversionOutcome::Queued),
        ConversionStatus::Denied => Ok(ConversionOutcome::Denied),
        ConversionStatus::RetryMaster => {
            Err(DlmError::RetryMaster(response.resource_name.clone()))
        }
        ConversionStatus::Failed(code) => {
            Err(code.into_error(&response.resource_name, response.holder))
        }
    }
}

pub struct LockManager {
    node: NodeId,
    config: Config,
    registry: Registry,
    directory: Directory,
    shadows: Mutex<HashMap<ShadowKey, Shadow>>,
    dispatcher: Arc<dyn Dispatcher>,
    subscribers: Mutex<Vec<Sender<LocalNotification>>>,
    events: EventLog,
    /// Highest recovery generation this node has seen.
    generation: AtomicU32,
}

impl LockManager {
    /// Build the manager for `config.node_id`. The config is validated first.
    pub fn new(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Result<Arc<Self>> {
        config.validate()?;
        let directory = Directory::new(config.members(), config.masters.clone());
        let events = EventLog::new(config.event_log.clone(), &config.node_name);
        debug!(
            "node {}: lock manager up, cluster {:?}",
            config.node_id,
            directory.members()
        );
        Ok(Arc::new(Self {
            node: config.node_id,
            config,
            registry: Registry::new(),
            directory,
            shadows: Mutex::new(HashMap::new()),
            dispatcher,
            subscribers: Mutex::new(Vec::new()),
            events,
            generation: AtomicU32::new(1),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The node currently responsible for `resource`.
    pub fn master_of(&self, resource: &str) -> NodeId {
        self.directory.master_of(resource)
    }

    /// Receive asynchronous grants, denials and blocking notices for holders
    /// on this node. Each subscriber sees every notification once.
    pub fn subscribe(&self) -> Receiver<LocalNotification> {
        let (tx, rx) = unbounded();
        locked(&self.subscribers).push(tx);
        rx
    }

    /// Take a first lock on `resource` for `holder`.
    pub fn acquire(
        &self,
        resource: &str,
        holder: HolderId,
        mode: LockMode,
        flags: LockFlags,
        timeout: Option<Duration>,
    ) -> Result<ConversionOutcome> {
        self.submit(RequestKind::Acquire, resource, holder, mode, flags, timeout)
    }

    /// Change the mode of a lock `holder` already holds.
    ///
    /// `Queued` means the master will push a `Granted` (or, after a cancel,
    /// `Denied`) notification later; see [`LockManager::subscribe`].
    pub fn request_conversion(
        &self,
        resource_name: &str,
        holder_id: HolderId,
        requested_mode: LockMode,
        flags: LockFlags,
        timeout: Option<Duration>,
    ) -> Result<ConversionOutcome> {
        self.submit(
            RequestKind::Convert,
            resource_name,
            holder_id,
            requested_mode,
            flags,
            timeout,
        )
    }

    /// Drop the holder's lock. A pending request is abandoned with it when
    /// this node masters the resource; remote holders must cancel first.
    pub fn release(
        &self,
        resource: &str,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.submit(
            RequestKind::Release,
            resource,
            holder,
            LockMode::NoLock,
            LockFlags::default(),
            timeout,
        )
        .map(|_| ())
    }

    /// Ask the master to abandon the holder's pending request. The outcome
    /// arrives as a notification; nothing changes locally until then.
    pub fn cancel_conversion(&self, resource: &str, holder: HolderId) -> Result<()> {
        self.check_local(resource, holder)?;
        let master = self.directory.master_of(resource);
        if self.directory.is_dead(master) {
            // Recovery already abandoned whatever was pending.
            return Ok(());
        }
        if master != self.node {
            return self.cancel_remote(master, resource, holder);
        }

        let request = self.local_request(resource, holder, LockMode::NoLock, LockFlags {
            cancel_requested: true,
            ..LockFlags::default()
        });
        let executed = self.execute(RequestKind::Cancel, &request)?;
        self.deliver(executed.notices);
        Ok(())
    }

    /// Snapshots of the resources this node masters, optionally filtered by
    /// a glob over resource names.
    pub fn snapshot(&self, pattern: Option<&str>) -> Result<Vec<ResourceSnapshot>> {
        self.registry.snapshot(pattern)
    }

    /// This node's view of `holder`'s lock on `resource`.
    pub fn holder_state(&self, resource: &str, holder: HolderId) -> Option<HolderState> {
        if let Some(handle) = self.registry.lookup(resource) {
            let res = locked(&handle);
            if let Some(lock) = res.lock(&holder) {
                return Some(HolderState {
                    granted: lock.granted_mode,
                    pending: lock.requested_mode,
                    blocking: lock.highest_blocked,
                });
            }
        }
        locked(&self.shadows)
            .get(&(resource.to_string(), holder))
            .map(|shadow| HolderState {
                granted: shadow.granted,
                pending: shadow.state.pending_mode(),
                blocking: shadow.blocking,
            })
    }

    fn submit(
        &self,
        kind: RequestKind,
        resource: &str,
        holder: HolderId,
        mode: LockMode,
        flags: LockFlags,
        timeout: Option<Duration>,
    ) -> Result<ConversionOutcome> {
        self.check_local(resource, holder)?;
        let master = self
            .directory
            .wait_for_live_master(resource, self.config.master_wait())?;
        if master != self.node {
            return self.remote_call(kind, master, resource, holder, mode, flags, timeout);
        }

        let request = self.local_request(resource, holder, mode, flags);
        let executed = self.execute(kind, &request)?;
        self.deliver(executed.notices);
        match executed.response {
            Some(response) => outcome_of(&response),
            None => Ok(ConversionOutcome::Queued),
        }
    }

    fn check_local(&self, resource: &str, holder: HolderId) -> Result<()> {
        if resource.is_empty() {
            return Err(DlmError::UserError("resource name is empty".to_string()));
        }
        if holder.node != self.node {
            return Err(DlmError::UserError(format!(
                "holder {} belongs to node {}, not node {}",
                holder, holder.node, self.node
            )));
        }
        Ok(())
    }

    /// A request for the local master path, stamped with what the registry
    /// currently records for the holder.
    fn local_request(
        &self,
        resource: &str,
        holder: HolderId,
        mode: LockMode,
        flags: LockFlags,
    ) -> ConversionRequest {
        let current_mode = self
            .registry
            .lookup(resource)
            .and_then(|handle| locked(&handle).lock(&holder).map(|l| l.granted_mode))
            .unwrap_or(LockMode::NoLock);
        ConversionRequest {
            resource_name: resource.to_string(),
            holder,
            current_mode,
            requested_mode: mode,
            flags,
            generation: self.generation(),
        }
    }

    /// Route notifications to local subscribers or over the network.
    fn deliver(&self, notices: Vec<Notification>) {
        for notice in notices {
            if notice.holder.node == self.node {
                self.notify_local(LocalNotification {
                    resource: notice.resource_name,
                    holder: notice.holder,
                    kind: notice.kind,
                });
                continue;
            }
            let to = notice.holder.node;
            if let Err(e) = self.dispatcher.send(self.node, to, &Message::Notify(notice)) {
                warn!("node {}: notification to node {} lost: {}", self.node, to, e);
            }
        }
    }

    fn notify_local(&self, notification: LocalNotification) {
        debug!(
            "node {}: {} on {}: {:?}",
            self.node, notification.holder, notification.resource, notification.kind
        );
        locked(&self.subscribers).retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

impl MessageHandler for LockManager {
    fn handle_message(&self, from: NodeId, message: Message) {
        match message {
            Message::Response(response) => self.apply_response(from, response),
            Message::Notify(notification) => self.apply_notification(from, notification),
            request => self.serve(from, request),
        }
    }
}
