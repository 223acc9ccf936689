//! Lock Resource Registry.
//!
//! Maps resource names to their in-memory state. The registry is the only
//! owner of a [`Resource`]; operations borrow it through a shared handle and
//! serialize on the per-resource mutex. Distinct resources never contend.
//!
//! # Lock order
//!
//! The registry map mutex may be taken before a resource mutex, never
//! after. Callers must drop any resource guard before calling back into the
//! registry.

use crate::error::{DlmError, Result};
use crate::lock::NodeId;
use crate::resource::{Resource, ResourceSnapshot};
use globset::Glob;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to one resource.
pub type ResourceHandle = Arc<Mutex<Resource>>;

/// Take a mutex, recovering the data if a previous holder panicked.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Debug, Default)]
pub struct Registry {
    resources: Mutex<HashMap<String, ResourceHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceHandle> {
        locked(&self.resources).get(name).cloned()
    }

    /// Fetch the resource, creating it mastered by `master` if absent.
    pub fn get_or_create(&self, name: &str, master: NodeId, generation: u32) -> ResourceHandle {
        let mut resources = locked(&self.resources);
        resources
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("registry: created resource {} (master {})", name, master);
                Arc::new(Mutex::new(Resource::new(name, master, generation)))
            })
            .clone()
    }

    /// Drop the resource if no queue holds a lock and no handle is
    /// outstanding. Returns whether it was removed.
    pub fn remove_if_unused(&self, name: &str) -> bool {
        let mut resources = locked(&self.resources);
        let Some(handle) = resources.get(name) else {
            return false;
        };
        // The map's own reference is the only one: nobody can be mid-operation.
        if Arc::strong_count(handle) > 1 {
            return false;
        }
        if !locked(handle).is_unused() {
            return false;
        }
        resources.remove(name);
        debug!("registry: dropped unused resource {}", name);
        true
    }

    /// Handles for every registered resource, in name order.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        let resources = locked(&self.resources);
        let mut named: Vec<(&String, &ResourceHandle)> = resources.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.resources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every resource whose name matches `pattern` (a glob),
    /// or of all resources when `pattern` is `None`.
    pub fn snapshot(&self, pattern: Option<&str>) -> Result<Vec<ResourceSnapshot>> {
        let matcher = match pattern {
            Some(p) => Some(
                Glob::new(p)
                    .map_err(|e| DlmError::UserError(format!("invalid resource glob '{}': {}", p, e)))?
                    .compile_matcher(),
            ),
            None => None,
        };

        Ok(self
            .handles()
            .iter()
            .map(|h| locked(h).snapshot())
            .filter(|s| matcher.as_ref().is_none_or(|m| m.is_match(&s.name)))
            .collect())
    }
}
