//! Master-side conversion handler.
//!
//! Runs every request for a resource this node masters, whether it came from
//! a local caller or over the network. Requests never block: each one is a
//! single critical section on the resource's mutex, followed by a queue
//! pass, and whoever a transition concerns is told exactly once.

use super::{LockManager, RequestKind};
use crate::engine::{self, QueueReport, Transition};
use crate::error::{DlmError, Result};
use crate::events::EventAction;
use crate::lock::{ConversionOutcome, NodeId};
use crate::mode::LockMode;
use crate::registry::locked;
use crate::resource::Resource;
use crate::wire::{
    ConversionRequest, ConversionResponse, ConversionStatus, FailureCode, Message, Notification,
    NotificationKind,
};
use log::{debug, info, warn};
use serde_json::json;

/// Result of one master-side request.
#[derive(Debug, Default)]
pub(super) struct Executed {
    /// Answer for the requester, if the request kind gets one.
    pub(super) response: Option<ConversionResponse>,
    /// Notifications produced by the queue pass that followed.
    pub(super) notices: Vec<Notification>,
}

fn respond(
    request: &ConversionRequest,
    status: ConversionStatus,
    mode: LockMode,
    generation: u32,
) -> ConversionResponse {
    ConversionResponse {
        resource_name: request.resource_name.clone(),
        holder: request.holder,
        status,
        mode,
        generation,
    }
}

impl LockManager {
    /// Serve a request that arrived from `from`.
    pub(super) fn serve(&self, from: NodeId, message: Message) {
        let Some((kind, request)) = RequestKind::split(message) else {
            return;
        };

        let executed = match self.execute(kind, &request) {
            Ok(executed) => executed,
            Err(e) => {
                debug!(
                    "node {}: refused {:?} from node {} on {}: {}",
                    self.node, kind, from, request.resource_name, e
                );
                let response = FailureCode::from_error(&e)
                    .filter(|_| kind.expects_response())
                    .map(|code| {
                        respond(
                            &request,
                            ConversionStatus::Failed(code),
                            request.current_mode,
                            request.generation,
                        )
                    });
                Executed {
                    response,
                    notices: Vec::new(),
                }
            }
        };

        // The requester hears its answer before anything the queue pass produced.
        if let Some(response) = executed.response
            && let Err(e) = self
                .dispatcher
                .send(self.node, from, &Message::Response(response))
        {
            warn!("node {}: response to node {} lost: {}", self.node, from, e);
        }
        self.deliver(executed.notices);
    }

    /// Apply one request to the authoritative state.
    pub(super) fn execute(
        &self,
        kind: RequestKind,
        request: &ConversionRequest,
    ) -> Result<Executed> {
        let name = request.resource_name.as_str();

        // Recover messages are how a newly assigned master learns about
        // surviving locks; they may arrive before its own assignment does.
        if kind != RequestKind::Recover && self.directory.master_of(name) != self.node {
            debug!(
                "node {}: no longer master of {}, asking {} to retry",
                self.node, name, request.holder
            );
            let response = kind.expects_response().then(|| {
                respond(
                    request,
                    ConversionStatus::RetryMaster,
                    request.current_mode,
                    request.generation,
                )
            });
            return Ok(Executed {
                response,
                notices: Vec::new(),
            });
        }

        let handle = match kind {
            RequestKind::Acquire | RequestKind::Recover => {
                self.registry.get_or_create(name, self.node, self.generation())
            }
            _ => self
                .registry
                .lookup(name)
                .ok_or_else(|| DlmError::UnknownResource(name.to_string()))?,
        };

        let result = {
            let mut res = locked(&handle);
            if kind == RequestKind::Recover {
                res.raise_generation(request.generation);
            }
            self.apply(&mut res, kind, request).map(|status| {
                let report = engine::process_queue(&mut res);
                let generation = res.generation();
                let mode = res
                    .lock(&request.holder)
                    .map(|l| l.granted_mode)
                    .unwrap_or(LockMode::NoLock);
                Executed {
                    response: status.map(|s| respond(request, s, mode, generation)),
                    notices: self.notices_for(&res, report),
                }
            })
        };

        drop(handle);
        self.registry.remove_if_unused(name);
        result
    }

    /// The engine call behind each request kind. Returns the response
    /// status, if the kind has one.
    fn apply(
        &self,
        res: &mut Resource,
        kind: RequestKind,
        request: &ConversionRequest,
    ) -> Result<Option<ConversionStatus>> {
        let holder = request.holder;
        let mode = request.requested_mode;

        let outcome = match kind {
            RequestKind::Acquire => engine::acquire(res, holder, mode, request.flags)?,
            RequestKind::Convert => engine::try_convert(res, holder, mode, request.flags)?,
            RequestKind::Release => {
                let lock = engine::release(res, holder)?;
                self.events.record(
                    self.events
                        .event(EventAction::Release)
                        .with_resource(res.name())
                        .with_holder(holder)
                        .with_details(json!({"mode": lock.granted_mode})),
                );
                return Ok(Some(ConversionStatus::Granted));
            }
            RequestKind::Cancel => {
                if engine::cancel(res, holder)? {
                    self.events.record(
                        self.events
                            .event(EventAction::Cancel)
                            .with_resource(res.name())
                            .with_holder(holder),
                    );
                }
                return Ok(None);
            }
            RequestKind::Recover => {
                engine::insert_recovered(res, holder, mode)?;
                info!(
                    "node {}: recovered {} at {} on {}",
                    self.node,
                    holder,
                    mode,
                    res.name()
                );
                return Ok(None);
            }
        };

        let (action, status) = match outcome {
            ConversionOutcome::Granted(_) => (EventAction::Grant, ConversionStatus::Granted),
            ConversionOutcome::Queued => (EventAction::Queue, ConversionStatus::Queued),
            ConversionOutcome::Denied => (EventAction::Deny, ConversionStatus::Denied),
        };
        self.events.record(
            self.events
                .event(action)
                .with_resource(res.name())
                .with_holder(holder)
                .with_details(json!({
                    "from": request.current_mode,
                    "to": mode,
                    "no_queue": request.flags.no_queue,
                })),
        );
        Ok(Some(status))
    }

    /// One notification per transition and blocking notice in `report`.
    pub(super) fn notices_for(&self, res: &Resource, report: QueueReport) -> Vec<Notification> {
        let mut notices = Vec::with_capacity(report.transitions.len() + report.blocking.len());

        for transition in report.transitions {
            let (action, kind) = match transition {
                Transition::Granted { mode, .. } => {
                    (EventAction::AsyncGrant, NotificationKind::Granted(mode))
                }
                Transition::Denied { mode, .. } => {
                    (EventAction::Deny, NotificationKind::Denied(mode))
                }
            };
            self.events.record(
                self.events
                    .event(action)
                    .with_resource(res.name())
                    .with_holder(transition.holder()),
            );
            notices.push(Notification {
                resource_name: res.name().to_string(),
                holder: transition.holder(),
                kind,
                generation: res.generation(),
            });
        }

        for notice in report.blocking {
            notices.push(Notification {
                resource_name: res.name().to_string(),
                holder: notice.holder,
                kind: NotificationKind::Blocking(notice.mode),
                generation: res.generation(),
            });
        }

        notices
    }
}
