//! Grant, convert, cancel and release over the three resource queues.

use crate::error::{DlmError, Result};
use crate::lock::{ConversionOutcome, HolderId, Lock, LockFlags, NodeId};
use crate::mode::LockMode;
use crate::resource::{QueueKind, Resource};
use log::debug;

/// A waiter that changed state during [`process_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved onto `granted` at `mode`.
    Granted { holder: HolderId, mode: LockMode },
    /// Cancelled. `mode` is what the holder still holds (`NL` if it never
    /// had a grant and has been removed).
    Denied { holder: HolderId, mode: LockMode },
}

impl Transition {
    pub fn holder(&self) -> HolderId {
        match self {
            Transition::Granted { holder, .. } | Transition::Denied { holder, .. } => *holder,
        }
    }
}

/// A granted holder that is in the way of a waiter asking for `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingNotice {
    pub holder: HolderId,
    pub mode: LockMode,
}

/// Everything a queue pass produced that someone must be told about.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub transitions: Vec<Transition>,
    pub blocking: Vec<BlockingNotice>,
}

impl QueueReport {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.blocking.is_empty()
    }
}

fn not_holder(res: &Resource, holder: &HolderId) -> DlmError {
    DlmError::NotHolder {
        resource: res.name().to_string(),
        holder: holder.to_string(),
    }
}

fn in_progress(res: &Resource, holder: &HolderId) -> DlmError {
    DlmError::ConversionInProgress {
        resource: res.name().to_string(),
        holder: holder.to_string(),
    }
}

/// `mode` against every granted lock except `skip`.
fn fits_granted(res: &Resource, mode: LockMode, skip: Option<HolderId>) -> bool {
    res.granted()
        .iter()
        .filter(|l| Some(l.holder) != skip)
        .all(|l| mode.compatible_with(l.granted_mode))
}

/// `mode` against the held and requested modes of every converting entry except `skip`.
fn fits_converting(res: &Resource, mode: LockMode, skip: Option<HolderId>) -> bool {
    res.converting()
        .iter()
        .filter(|l| Some(l.holder) != skip)
        .all(|l| mode.compatible_with(l.granted_mode) && mode.compatible_with(l.wanted_mode()))
}

/// `mode` against the held mode only of every converting entry except `skip`.
fn fits_converting_held(res: &Resource, mode: LockMode, skip: Option<HolderId>) -> bool {
    res.converting()
        .iter()
        .filter(|l| Some(l.holder) != skip)
        .all(|l| mode.compatible_with(l.granted_mode))
}

/// `mode` against the requested mode of every blocked entry.
fn fits_blocked(res: &Resource, mode: LockMode) -> bool {
    res.blocked()
        .iter()
        .all(|l| mode.compatible_with(l.wanted_mode()))
}

/// Request a first grant on `res` for a holder that has no lock there yet.
pub fn acquire(
    res: &mut Resource,
    holder: HolderId,
    mode: LockMode,
    flags: LockFlags,
) -> Result<ConversionOutcome> {
    if res.queue_of(&holder).is_some() {
        return Err(DlmError::AlreadyHolder {
            resource: res.name().to_string(),
            holder: holder.to_string(),
        });
    }

    if fits_granted(res, mode, None) && fits_converting(res, mode, None) && fits_blocked(res, mode) {
        res.push(QueueKind::Granted, Lock::granted(holder, mode));
        debug!("{}: granted {} to new holder {}", res.name(), mode, holder);
        return Ok(ConversionOutcome::Granted(mode));
    }

    if flags.no_queue {
        debug!("{}: {} denied {} (no_queue)", res.name(), holder, mode);
        return Ok(ConversionOutcome::Denied);
    }

    let flags = LockFlags {
        cancel_requested: false,
        ..flags
    };
    res.push(QueueKind::Blocked, Lock::waiting(holder, mode, flags));
    debug!("{}: {} blocked waiting for {}", res.name(), holder, mode);
    Ok(ConversionOutcome::Queued)
}

/// Convert a granted lock to `requested`.
///
/// Converting to the currently granted mode is a no-op that reports
/// `Granted`. Never reorders `granted`; an immediate grant updates the lock
/// where it stands.
pub fn try_convert(
    res: &mut Resource,
    holder: HolderId,
    requested: LockMode,
    flags: LockFlags,
) -> Result<ConversionOutcome> {
    let current = match res.queue_of(&holder) {
        None => return Err(not_holder(res, &holder)),
        Some(QueueKind::Converting) | Some(QueueKind::Blocked) => {
            return Err(in_progress(res, &holder));
        }
        Some(QueueKind::Granted) => match res.lock(&holder) {
            Some(lock) => lock.granted_mode,
            None => return Err(not_holder(res, &holder)),
        },
    };

    if requested == current {
        return Ok(ConversionOutcome::Granted(requested));
    }

    let grantable = requested < current
        || (fits_granted(res, requested, Some(holder))
            && fits_converting(res, requested, Some(holder)));

    if grantable {
        res.regrant_in_place(&holder, requested);
        debug!(
            "{}: converted {} {} -> {}",
            res.name(),
            holder,
            current,
            requested
        );
        return Ok(ConversionOutcome::Granted(requested));
    }

    if flags.no_queue {
        debug!(
            "{}: {} denied {} -> {} (no_queue)",
            res.name(),
            holder,
            current,
            requested
        );
        return Ok(ConversionOutcome::Denied);
    }

    if let Some((_, mut lock)) = res.take(&holder) {
        lock.requested_mode = Some(requested);
        lock.flags = LockFlags {
            cancel_requested: false,
            ..flags
        };
        res.push(QueueKind::Converting, lock);
    }
    debug!(
        "{}: {} queued {} -> {}",
        res.name(),
        holder,
        current,
        requested
    );
    Ok(ConversionOutcome::Queued)
}

/// Mark a waiting entry for cancellation; the next [`process_queue`] applies it.
///
/// Returns `false` when the holder has nothing pending.
pub fn cancel(res: &mut Resource, holder: HolderId) -> Result<bool> {
    match res.queue_of(&holder) {
        None => Err(not_holder(res, &holder)),
        Some(QueueKind::Granted) => Ok(false),
        Some(_) => {
            if let Some(lock) = res.lock_mut(&holder) {
                lock.flags.cancel_requested = true;
            }
            Ok(true)
        }
    }
}

/// Drop the holder's lock, wherever it is queued.
pub fn release(res: &mut Resource, holder: HolderId) -> Result<Lock> {
    match res.take(&holder) {
        Some((kind, lock)) => {
            debug!(
                "{}: released {} ({:?}, held {})",
                res.name(),
                holder,
                kind,
                lock.granted_mode
            );
            Ok(lock)
        }
        None => Err(not_holder(res, &holder)),
    }
}

/// Remove every lock owned by `node`. Returns how many were freed.
pub fn purge_node(res: &mut Resource, node: NodeId) -> usize {
    let holders = res.holders_on(node);
    for holder in &holders {
        res.take(holder);
    }
    if !holders.is_empty() {
        debug!(
            "{}: freed {} locks for dead node {}",
            res.name(),
            holders.len(),
            node
        );
    }
    holders.len()
}

/// Re-register a lock reported by a surviving node after a master change.
pub fn insert_recovered(res: &mut Resource, holder: HolderId, mode: LockMode) -> Result<()> {
    if res.queue_of(&holder).is_some() {
        return Err(DlmError::AlreadyHolder {
            resource: res.name().to_string(),
            holder: holder.to_string(),
        });
    }
    res.push(QueueKind::Granted, Lock::granted(holder, mode));
    Ok(())
}

/// Apply cancellations, promote waiters in FIFO order, then compute
/// blocking notices for whoever is still waiting.
pub fn process_queue(res: &mut Resource) -> QueueReport {
    let mut report = QueueReport::default();

    apply_cancellations(res, &mut report);

    // Converting first: these holders already own part of the resource.
    // Nothing is ahead of the head, so only the held modes of the entries
    // behind it matter.
    while let Some(head) = res.converting().first() {
        let holder = head.holder;
        let wanted = head.wanted_mode();
        if !(fits_granted(res, wanted, Some(holder))
            && fits_converting_held(res, wanted, Some(holder)))
        {
            break;
        }
        promote(res, holder, wanted, &mut report);
    }

    while let Some(head) = res.blocked().first() {
        let holder = head.holder;
        let wanted = head.wanted_mode();
        if !(fits_granted(res, wanted, Some(holder)) && fits_converting(res, wanted, Some(holder))) {
            break;
        }
        promote(res, holder, wanted, &mut report);
    }

    collect_blocking(res, &mut report);
    report
}

fn promote(res: &mut Resource, holder: HolderId, mode: LockMode, report: &mut QueueReport) {
    if let Some((_, mut lock)) = res.take(&holder) {
        lock.grant(mode);
        res.push(QueueKind::Granted, lock);
        debug!("{}: promoted {} to {}", res.name(), holder, mode);
        report.transitions.push(Transition::Granted { holder, mode });
    }
}

fn apply_cancellations(res: &mut Resource, report: &mut QueueReport) {
    let cancelled: Vec<HolderId> = res
        .converting()
        .iter()
        .chain(res.blocked())
        .filter(|l| l.flags.cancel_requested)
        .map(|l| l.holder)
        .collect();

    for holder in cancelled {
        let Some((kind, mut lock)) = res.take(&holder) else {
            continue;
        };
        let restored = lock.granted_mode;
        if kind == QueueKind::Converting {
            lock.grant(restored);
            res.push(QueueKind::Granted, lock);
        }
        debug!(
            "{}: cancelled pending request of {} (holds {})",
            res.name(),
            holder,
            restored
        );
        report.transitions.push(Transition::Denied {
            holder,
            mode: restored,
        });
    }
}

/// For each waiter, tell every holder whose granted mode conflicts with it.
/// A holder is told again only when a stronger mode is blocked behind it.
fn collect_blocking(res: &mut Resource, report: &mut QueueReport) {
    let waiters: Vec<(HolderId, LockMode)> = res
        .converting()
        .iter()
        .chain(res.blocked())
        .map(|l| (l.holder, l.wanted_mode()))
        .collect();

    for (waiter, wanted) in waiters {
        let blockers: Vec<HolderId> = res
            .granted()
            .iter()
            .chain(res.converting())
            .filter(|l| l.holder != waiter && !wanted.compatible_with(l.granted_mode))
            .map(|l| l.holder)
            .collect();

        for blocker in blockers {
            if let Some(lock) = res.lock_mut(&blocker)
                && lock.highest_blocked.is_none_or(|seen| seen < wanted)
            {
                lock.highest_blocked = Some(wanted);
                report.blocking.push(BlockingNotice {
                    holder: blocker,
                    mode: wanted,
                });
            }
        }
    }
}
