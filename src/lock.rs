//! Holders, locks and request outcomes.

use crate::mode::LockMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-wide node number.
pub type NodeId = u32;

/// One claim on a resource: the node it lives on plus a node-local cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HolderId {
    pub node: NodeId,
    pub cookie: u64,
}

impl HolderId {
    pub fn new(node: NodeId, cookie: u64) -> Self {
        Self { node, cookie }
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.cookie)
    }
}

/// Per-request and per-lock flags.
///
/// On the wire this is a single byte: bit 0 is `no_queue`, bit 1 is
/// `cancel_requested`. Other bits are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockFlags {
    /// Fail with `Denied` instead of queueing.
    pub no_queue: bool,
    /// The waiter asked to abandon its pending request.
    pub cancel_requested: bool,
}

impl LockFlags {
    const NO_QUEUE: u8 = 0b01;
    const CANCEL: u8 = 0b10;

    /// Flags with only `no_queue` set.
    pub fn no_queue() -> Self {
        Self {
            no_queue: true,
            cancel_requested: false,
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.no_queue {
            bits |= Self::NO_QUEUE;
        }
        if self.cancel_requested {
            bits |= Self::CANCEL;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            no_queue: bits & Self::NO_QUEUE != 0,
            cancel_requested: bits & Self::CANCEL != 0,
        }
    }
}

/// One holder's claim on a resource, as held by the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub holder: HolderId,

    /// Mode currently granted. `NL` for an entry still waiting on `blocked`.
    pub granted_mode: LockMode,

    /// Mode being waited for; set only while on `converting` or `blocked`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_mode: Option<LockMode>,

    pub flags: LockFlags,

    /// Highest mode this holder has been told is blocked behind it.
    #[serde(skip)]
    pub highest_blocked: Option<LockMode>,
}

impl Lock {
    /// A lock granted outright at `mode`.
    pub fn granted(holder: HolderId, mode: LockMode) -> Self {
        Self {
            holder,
            granted_mode: mode,
            requested_mode: None,
            flags: LockFlags::default(),
            highest_blocked: None,
        }
    }

    /// A lock waiting for its first grant.
    pub fn waiting(holder: HolderId, mode: LockMode, flags: LockFlags) -> Self {
        Self {
            holder,
            granted_mode: LockMode::NoLock,
            requested_mode: Some(mode),
            flags,
            highest_blocked: None,
        }
    }

    /// The mode this entry is waiting for, or its granted mode when idle.
    pub fn wanted_mode(&self) -> LockMode {
        self.requested_mode.unwrap_or(self.granted_mode)
    }

    /// Install `mode` as the granted mode and clear any pending request.
    pub(crate) fn grant(&mut self, mode: LockMode) {
        if self.granted_mode != mode {
            self.highest_blocked = None;
        }
        self.granted_mode = mode;
        self.requested_mode = None;
        self.flags = LockFlags::default();
    }
}

/// Caller-visible result of an acquire or conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    /// The lock is now held at this mode.
    Granted(LockMode),
    /// The request waits on the master's queue; a `Granted` notification follows.
    Queued,
    /// Refused without a state change.
    Denied,
}

impl fmt::Display for ConversionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionOutcome::Granted(mode) => write!(f, "granted({})", mode),
            ConversionOutcome::Queued => write!(f, "queued"),
            ConversionOutcome::Denied => write!(f, "denied"),
        }
    }
}
