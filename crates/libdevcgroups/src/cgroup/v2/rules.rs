//! Device rules granted so far, per cgroup v2 directory.
//!
//! A cgroup v2 device program cannot be extended in place, so every grant
//! replaces the program with one covering all rules recorded for that cgroup.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::device::DeviceRule;

pub type RuleSet = BTreeSet<DeviceRule>;

#[derive(Debug, Default)]
pub struct RuleStore {
    entries: Mutex<HashMap<PathBuf, Arc<Mutex<RuleSet>>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule set of `cgroup`, created empty on first use. Holding its lock across
    /// a program replacement keeps concurrent grants for the cgroup from losing
    /// each other's rules.
    pub fn entry(&self, cgroup: &Path) -> Arc<Mutex<RuleSet>> {
        let mut entries = lock(&self.entries);
        Arc::clone(entries.entry(cgroup.to_path_buf()).or_default())
    }

    pub fn rules(&self, cgroup: &Path) -> Vec<DeviceRule> {
        let entry = lock(&self.entries).get(cgroup).cloned();
        match entry {
            Some(rules) => lock(&rules).iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets cgroups whose directory is gone and returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|cgroup, _| {
            let exists = cgroup.is_dir();
            if !exists {
                tracing::debug!(cgroup = %cgroup.display(), "forget rules of removed cgroup");
            }
            exists
        });
        before - entries.len()
    }
}

// a panic while holding a lock never leaves a half-updated set behind
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
