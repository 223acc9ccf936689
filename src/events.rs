//! Event logging for the lock manager.
//!
//! Append-only audit of lock transitions in NDJSON format (one JSON object
//! per line), written to the file named by `event_log` in the node config.
//! Logging is best-effort: a failed append is reported through `log::warn!`
//! and never fails the lock operation that produced it.
//!
//! # Event Format
//!
//! Each event is a JSON object with the following fields:
//! - `ts`: RFC3339 timestamp
//! - `action`: what happened (grant, queue, deny, release, node_down, ...)
//! - `actor`: the node that logged it (e.g., `node2@HOST`)
//! - `resource`: resource name, when the event concerns one
//! - `holder`: `node:cookie`, when the event concerns one holder
//! - `details`: freeform object with action-specific details

use crate::error::{DlmError, Result};
use crate::lock::HolderId;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Actions that can be logged as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// A request was granted synchronously.
    Grant,
    /// A queued request was granted later.
    AsyncGrant,
    /// A request was put on a queue.
    Queue,
    /// A request was refused or cancelled.
    Deny,
    /// A lock was released.
    Release,
    /// A holder asked to abandon a pending request.
    Cancel,
    /// Locks of a dead node were freed.
    Purge,
    /// A node was reported down.
    NodeDown,
    /// A replacement master was assigned.
    MasterAssigned,
    /// A message from before a recovery event was discarded.
    StaleDropped,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::Grant => write!(f, "grant"),
            EventAction::AsyncGrant => write!(f, "async_grant"),
            EventAction::Queue => write!(f, "queue"),
            EventAction::Deny => write!(f, "deny"),
            EventAction::Release => write!(f, "release"),
            EventAction::Cancel => write!(f, "cancel"),
            EventAction::Purge => write!(f, "purge"),
            EventAction::NodeDown => write!(f, "node_down"),
            EventAction::MasterAssigned => write!(f, "master_assigned"),
            EventAction::StaleDropped => write!(f, "stale_dropped"),
        }
    }
}

/// An event record for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// RFC3339 timestamp when the event occurred.
    pub ts: DateTime<Utc>,

    pub action: EventAction,

    /// The node that recorded the event.
    pub actor: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,

    /// Freeform details object with action-specific information.
    pub details: Value,
}

impl Event {
    pub fn new(action: EventAction, actor: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            action,
            actor: actor.into(),
            resource: None,
            holder: None,
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_holder(mut self, holder: HolderId) -> Self {
        self.holder = Some(holder.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Serialize the event to a single-line JSON string.
    pub fn to_ndjson_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DlmError::UserError(format!("failed to serialize event to JSON: {}", e)))
    }
}

/// Destination for a node's events.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
    actor: String,
}

impl EventLog {
    /// Log to `path`, or nowhere when `None`.
    pub fn new(path: Option<PathBuf>, node_name: &str) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            path,
            actor: format!("{}@{}", node_name, host),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            actor: String::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start an event stamped with this node as actor.
    pub fn event(&self, action: EventAction) -> Event {
        Event::new(action, self.actor.clone())
    }

    /// Append `event`, logging (not returning) any failure.
    pub fn record(&self, event: Event) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_event(path, &event) {
            warn!("event log: {}", e);
        }
    }
}

/// Append an event to the events log at `path`.
///
/// The file and its parent directory are created if needed. Each append
/// results in one line with a trailing newline.
pub fn append_event(path: &Path, event: &Event) -> Result<()> {
    let json_line = event.to_ndjson_line()?;

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        fs::create_dir_all(dir).map_err(|e| {
            DlmError::UserError(format!(
                "failed to create events directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            DlmError::UserError(format!(
                "failed to open events file '{}': {}",
                path.display(),
                e
            ))
        })?;

    writeln!(file, "{}", json_line).map_err(|e| {
        DlmError::UserError(format!(
            "failed to write event to '{}': {}",
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Read every event from an NDJSON log.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let content = fs::read_to_string(path).map_err(|e| {
        DlmError::UserError(format!(
            "failed to read events file '{}': {}",
            path.display(),
            e
        ))
    })?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| DlmError::UserError(format!("failed to parse event line: {}", e)))
        })
        .collect()
}
