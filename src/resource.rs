//! Per-resource lock state held by the master.
//!
//! A `Resource` owns three ordered queues. Insertion order is grant order on
//! `granted` and arrival order on `converting` and `blocked`. A holder is on
//! at most one queue at a time; `index` maps each holder to its queue and
//! position so lookups do not scan. Removing a lock shifts the positions of
//! the locks behind it on the same queue.

use crate::lock::{HolderId, Lock, NodeId};
use crate::mode::LockMode;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Which queue a lock sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Granted,
    Converting,
    Blocked,
}

/// Where a holder's lock sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    kind: QueueKind,
    pos: usize,
}

#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    master: NodeId,
    granted: Vec<Lock>,
    converting: Vec<Lock>,
    blocked: Vec<Lock>,
    index: HashMap<HolderId, Slot>,
    /// Locks per node currently on any queue.
    refs: BTreeMap<NodeId, u32>,
    generation: u32,
}

/// Serializable view of a resource for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub master: NodeId,
    pub generation: u32,
    pub granted: Vec<Lock>,
    pub converting: Vec<Lock>,
    pub blocked: Vec<Lock>,
}

impl Resource {
    pub fn new(name: impl Into<String>, master: NodeId, generation: u32) -> Self {
        Self {
            name: name.into(),
            master,
            granted: Vec::new(),
            converting: Vec::new(),
            blocked: Vec::new(),
            index: HashMap::new(),
            refs: BTreeMap::new(),
            generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> NodeId {
        self.master
    }

    pub fn set_master(&mut self, master: NodeId) {
        self.master = master;
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Raise the generation; never lowers it.
    pub fn raise_generation(&mut self, generation: u32) {
        self.generation = self.generation.max(generation);
    }

    pub fn granted(&self) -> &[Lock] {
        &self.granted
    }

    pub fn converting(&self) -> &[Lock] {
        &self.converting
    }

    pub fn blocked(&self) -> &[Lock] {
        &self.blocked
    }

    pub fn queue_of(&self, holder: &HolderId) -> Option<QueueKind> {
        self.index.get(holder).map(|slot| slot.kind)
    }

    pub fn lock(&self, holder: &HolderId) -> Option<&Lock> {
        let slot = *self.index.get(holder)?;
        self.queue(slot.kind).get(slot.pos)
    }

    pub(crate) fn lock_mut(&mut self, holder: &HolderId) -> Option<&mut Lock> {
        let slot = *self.index.get(holder)?;
        self.queue_mut(slot.kind).get_mut(slot.pos)
    }

    /// Append `lock` to the tail of `kind`.
    pub(crate) fn push(&mut self, kind: QueueKind, lock: Lock) {
        debug_assert!(
            !self.index.contains_key(&lock.holder),
            "holder {} already queued on {}",
            lock.holder,
            self.name
        );
        let pos = self.queue(kind).len();
        self.index.insert(lock.holder, Slot { kind, pos });
        *self.refs.entry(lock.holder.node).or_insert(0) += 1;
        self.queue_mut(kind).push(lock);
    }

    /// Remove `holder` from whichever queue it is on.
    pub(crate) fn take(&mut self, holder: &HolderId) -> Option<(QueueKind, Lock)> {
        let Slot { kind, pos } = self.index.remove(holder)?;
        let Self {
            granted,
            converting,
            blocked,
            index,
            ..
        } = self;
        let queue = match kind {
            QueueKind::Granted => granted,
            QueueKind::Converting => converting,
            QueueKind::Blocked => blocked,
        };
        let lock = queue.remove(pos);
        for behind in &queue[pos..] {
            if let Some(slot) = index.get_mut(&behind.holder) {
                slot.pos -= 1;
            }
        }

        if let Some(count) = self.refs.get_mut(&holder.node) {
            *count -= 1;
            if *count == 0 {
                self.refs.remove(&holder.node);
            }
        }
        Some((kind, lock))
    }

    /// Update the granted mode of a lock on `granted` without moving it.
    pub(crate) fn regrant_in_place(&mut self, holder: &HolderId, mode: LockMode) -> bool {
        if self.queue_of(holder) != Some(QueueKind::Granted) {
            return false;
        }
        match self.lock_mut(holder) {
            Some(lock) => {
                lock.grant(mode);
                true
            }
            None => false,
        }
    }

    /// Nodes currently holding a reference to this resource.
    pub fn referencing_nodes(&self) -> Vec<NodeId> {
        self.refs.keys().copied().collect()
    }

    /// All holders belonging to `node`, in queue order.
    pub fn holders_on(&self, node: NodeId) -> Vec<HolderId> {
        self.granted
            .iter()
            .chain(&self.converting)
            .chain(&self.blocked)
            .filter(|l| l.holder.node == node)
            .map(|l| l.holder)
            .collect()
    }

    /// No queued locks and no node references: the registry may drop it.
    pub fn is_unused(&self) -> bool {
        self.granted.is_empty()
            && self.converting.is_empty()
            && self.blocked.is_empty()
            && self.refs.is_empty()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            name: self.name.clone(),
            master: self.master,
            generation: self.generation,
            granted: self.granted.clone(),
            converting: self.converting.clone(),
            blocked: self.blocked.clone(),
        }
    }

    fn queue(&self, kind: QueueKind) -> &Vec<Lock> {
        match kind {
            QueueKind::Granted => &self.granted,
            QueueKind::Converting => &self.converting,
            QueueKind::Blocked => &self.blocked,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<Lock> {
        match kind {
            QueueKind::Granted => &mut self.granted,
            QueueKind::Converting => &mut self.converting,
            QueueKind::Blocked => &mut self.blocked,
        }
    }

    /// Check that every holder appears on exactly one queue and the index agrees.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for (kind, queue) in [
            (QueueKind::Granted, &self.granted),
            (QueueKind::Converting, &self.converting),
            (QueueKind::Blocked, &self.blocked),
        ] {
            for (pos, lock) in queue.iter().enumerate() {
                assert!(
                    seen.insert(lock.holder),
                    "{} appears on more than one queue",
                    lock.holder
                );
                assert_eq!(self.index.get(&lock.holder), Some(&Slot { kind, pos }));
            }
        }
        assert_eq!(seen.len(), self.index.len());
        let total: u32 = self.refs.values().sum();
        assert_eq!(total as usize, seen.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(node: NodeId, cookie: u64) -> HolderId {
        HolderId::new(node, cookie)
    }

    #[test]
    fn push_and_take_maintain_index_and_refs() {
        let mut res = Resource::new("R", 1, 1);
        res.push(QueueKind::Granted, Lock::granted(holder(1, 1), LockMode::ProtectedRead));
        res.push(QueueKind::Granted, Lock::granted(holder(2, 1), LockMode::ProtectedRead));
        res.assert_consistent();
        assert_eq!(res.referencing_nodes(), vec![1, 2]);

        let (kind, lock) = res.take(&holder(2, 1)).unwrap();
        assert_eq!(kind, QueueKind::Granted);
        assert_eq!(lock.granted_mode, LockMode::ProtectedRead);
        assert_eq!(res.referencing_nodes(), vec![1]);
        assert!(res.take(&holder(2, 1)).is_none());
        res.assert_consistent();
    }

    #[test]
    fn taking_from_the_middle_shifts_positions_behind_it() {
        let mut res = Resource::new("R", 1, 1);
        for cookie in 1..=4 {
            res.push(
                QueueKind::Converting,
                Lock::waiting(holder(2, cookie), LockMode::Exclusive, Default::default()),
            );
        }

        res.take(&holder(2, 2)).unwrap();
        res.assert_consistent();
        assert_eq!(res.lock(&holder(2, 3)).unwrap().holder, holder(2, 3));
        assert_eq!(res.lock(&holder(2, 4)).unwrap().holder, holder(2, 4));

        res.lock_mut(&holder(2, 4)).unwrap().highest_blocked = Some(LockMode::ProtectedRead);
        assert_eq!(
            res.converting()[2].highest_blocked,
            Some(LockMode::ProtectedRead)
        );

        res.take(&holder(2, 1)).unwrap();
        res.take(&holder(2, 4)).unwrap();
        res.assert_consistent();
        assert_eq!(res.converting().len(), 1);
        assert_eq!(res.lock(&holder(2, 3)).unwrap().holder, holder(2, 3));
    }

    #[test]
    fn unused_only_when_all_queues_empty() {
        let mut res = Resource::new("R", 1, 1);
        assert!(res.is_unused());
        res.push(
            QueueKind::Blocked,
            Lock::waiting(holder(3, 9), LockMode::Exclusive, Default::default()),
        );
        assert!(!res.is_unused());
        res.take(&holder(3, 9));
        assert!(res.is_unused());
    }

    #[test]
    fn generation_never_decreases() {
        let mut res = Resource::new("R", 1, 5);
        res.raise_generation(3);
        assert_eq!(res.generation(), 5);
        res.raise_generation(7);
        assert_eq!(res.generation(), 7);
    }

    #[test]
    fn holders_on_lists_every_queue() {
        let mut res = Resource::new("R", 1, 1);
        res.push(QueueKind::Granted, Lock::granted(holder(2, 1), LockMode::ProtectedRead));
        res.push(
            QueueKind::Blocked,
            Lock::waiting(holder(2, 2), LockMode::Exclusive, Default::default()),
        );
        res.push(QueueKind::Granted, Lock::granted(holder(1, 1), LockMode::ConcurrentRead));
        assert_eq!(res.holders_on(2), vec![holder(2, 1), holder(2, 2)]);
    }
}
