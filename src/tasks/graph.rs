//! Reverse-edge index over blocking edges.
//!
//! For each task id, the set of tasks that list it in `blocked_by`. Cascades
//! triggered by a completion touch only this direct-dependent frontier — the
//! graph is never rescanned in full.

use std::collections::{BTreeSet, HashMap};

use super::model::Task;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// blocker id → ids of tasks whose `blocked_by` contains it.
    blocked_dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every blocking edge a task declares. Quarantined tasks are
    /// excluded from cascades entirely.
    pub fn index_task(&mut self, task: &Task) {
        if task.is_quarantined() || task.archived {
            return;
        }
        for blocker in &task.blocked_by {
            self.blocked_dependents
                .entry(blocker.clone())
                .or_default()
                .insert(task.id.clone());
        }
    }

    /// Drop every edge a task declares (archive or re-index).
    pub fn unindex_task(&mut self, task: &Task) {
        for blocker in &task.blocked_by {
            if let Some(dependents) = self.blocked_dependents.get_mut(blocker) {
                dependents.remove(&task.id);
                if dependents.is_empty() {
                    self.blocked_dependents.remove(blocker);
                }
            }
        }
    }

    /// Replace a task's edges after a committed mutation.
    pub fn reindex(&mut self, old: &Task, new: &Task) {
        self.unindex_task(old);
        self.index_task(new);
    }

    /// The direct-dependent frontier of a completed blocker, in deterministic
    /// order. The caller removes the blocking edge from each dependent as its
    /// own per-task mutation.
    pub fn frontier(&self, blocker: &str) -> Vec<String> {
        self.blocked_dependents
            .get(blocker)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.blocked_dependents.values().map(BTreeSet::len).sum()
    }
}
