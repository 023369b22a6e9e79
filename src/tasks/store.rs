//! Authoritative task registry.
//!
//! Every mutation is routed through the validation gate, the state machine,
//! and the dependency graph before commit; after commit the journal is
//! appended, the snapshot persisted, and subscribers notified. At most one
//! mutation is in flight per task id — a per-task async lock table serializes
//! same-task races while unrelated tasks mutate concurrently.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::validate;

use super::graph::DependencyGraph;
use super::history::diff_events;
use super::model::{CreateTask, Task, TaskKind, TaskPatch, TaskStatus};
use super::state;
use super::storage::SnapshotStore;

/// Minimal description of one committed mutation, pushed to the sync layer.
/// Delivery is fire-and-forget and never blocks or fails the commit.
#[derive(Debug, Clone)]
pub struct CommitDelta {
    pub task_id: String,
    pub channels: Vec<String>,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    /// Names of the top-level fields that changed in this commit.
    pub changed: Vec<String>,
    /// New values of the changed fields.
    pub fields: BTreeMap<String, Value>,
    /// Full post-commit snapshot, used for resync delivery.
    pub task: Task,
}

pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// Per-task mutation locks. Entries are created on demand and live for
    /// the process lifetime (task ids are bounded by the data set).
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    graph: Mutex<DependencyGraph>,
    persist: Option<SnapshotStore>,
    commits: std::sync::Mutex<Option<mpsc::UnboundedSender<CommitDelta>>>,
}

impl TaskStore {
    pub fn new(persist: Option<SnapshotStore>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            graph: Mutex::new(DependencyGraph::new()),
            persist,
            commits: std::sync::Mutex::new(None),
        }
    }

    /// Wire the commit stream to the sync layer. Send errors are ignored —
    /// a closed receiver only means no one is broadcasting.
    pub fn set_commit_sink(&self, tx: mpsc::UnboundedSender<CommitDelta>) {
        if let Ok(mut slot) = self.commits.lock() {
            *slot = Some(tx);
        }
    }

    /// Load persisted snapshots into the registry. Corrupt snapshots come
    /// back pre-quarantined and are registered but excluded from the graph.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(persist) = &self.persist else {
            return Ok(0);
        };
        let loaded = persist.load_all().await?;
        let count = loaded.len();
        let mut tasks = self.tasks.write().await;
        let mut graph = self.graph.lock().await;
        for task in loaded {
            graph.index_task(&task);
            tasks.insert(task.id.clone(), task);
        }
        Ok(count)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// All non-archived tasks, optionally restricted to one domain.
    pub async fn list(&self, domain: Option<&str>) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.archived)
            .filter(|t| match domain {
                Some(d) => t.domain.as_deref().unwrap_or("default") == d,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Read snapshot for the query engine (includes archived/quarantined —
    /// the query layer filters them so exclusion stays in one place).
    pub async fn snapshot(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    pub async fn create(&self, create: CreateTask) -> EngineResult<Task> {
        validate::validate_create(&create)?;
        let id = create.id.clone();
        let _guard = self.lock_task(&id).await;

        {
            let tasks = self.tasks.read().await;
            if tasks.contains_key(&id) {
                return Err(EngineError::validation(
                    "id",
                    &id,
                    "a task with this id already exists",
                ));
            }
            for edge in create.dependencies.iter().chain(create.blocked_by.iter()) {
                if !tasks.contains_key(edge) {
                    return Err(EngineError::validation(
                        "dependencies",
                        edge,
                        "references an unknown task",
                    ));
                }
            }
        }

        let mut task = create.into_task();
        if task.is_group() && task.status != TaskStatus::Pending {
            return Err(EngineError::validation(
                "status",
                task.status,
                "group status is derived from members and cannot be set",
            ));
        }
        // A live blocking edge forces BLOCKED regardless of the requested
        // initial status.
        if !task.blocked_by.is_empty() {
            task.status = TaskStatus::Blocked;
        } else if task.status == TaskStatus::Completed {
            let statuses = self.dependency_statuses(&task).await;
            let mut probe = task.clone();
            probe.status = TaskStatus::InProgress;
            state::check_transition(&probe, TaskStatus::Completed, |dep| {
                statuses.get(dep).copied()
            })?;
        }

        {
            let mut tasks = self.tasks.write().await;
            let mut graph = self.graph.lock().await;
            graph.index_task(&task);
            tasks.insert(id.clone(), task.clone());
        }
        drop(_guard);

        self.after_commit(&task, vec!["created".to_string()], BTreeMap::new())
            .await;
        if let Some(group) = task.group_id().map(String::from) {
            self.recompute_group(&group).await;
        }
        debug!(task_id = %id, status = %task.status, "task created");
        Ok(task)
    }

    pub async fn update(&self, id: &str, patch: TaskPatch) -> EngineResult<Task> {
        validate::validate_patch(id, &patch)?;
        let guard = self.lock_task(id).await;

        let old = match self.get(id).await {
            Some(task) => task,
            None => return Err(EngineError::NotFound { id: id.to_string() }),
        };
        if old.archived {
            return Err(EngineError::validation("id", id, "task is archived"));
        }
        if old.is_quarantined() {
            // Repair means fixing the snapshot on disk and restarting.
            return Err(EngineError::validation(
                "id",
                id,
                "task is quarantined after an unreadable snapshot",
            ));
        }

        let candidate = self.apply_patch(&old, &patch).await?;

        let events = diff_events(&old, &candidate, patch.assignment_reason.as_deref());
        let adds_comment = patch.add_comment.is_some();
        let edits_comment = patch.edit_comment.is_some();
        let adds_interaction = patch.agent_interaction.is_some();
        if events.is_empty() && !adds_comment && !edits_comment && !adds_interaction {
            // Idempotent re-apply: no history entries, no commit, no delta.
            debug!(task_id = %id, "update is a no-op — skipping commit");
            return Ok(old);
        }

        let mut committed = candidate;
        for event in events {
            committed.history.record(event);
        }
        if let Some(comment) = &patch.add_comment {
            committed.history.add_comment(&comment.content, &comment.author);
        }
        if let Some(edit) = &patch.edit_comment {
            if !committed.history.edit_comment(&edit.id, &edit.content) {
                return Err(EngineError::validation(
                    "edit_comment.id",
                    &edit.id,
                    "no comment with this id",
                ));
            }
        }
        if let Some(interaction) = &patch.agent_interaction {
            committed.history.add_interaction(
                &interaction.interaction_type,
                &interaction.content,
                interaction.context.as_deref(),
            );
        }
        committed.touch();

        {
            let mut tasks = self.tasks.write().await;
            let mut graph = self.graph.lock().await;
            graph.reindex(&old, &committed);
            tasks.insert(id.to_string(), committed.clone());
        }
        drop(guard);

        let (changed, fields) = changed_fields(&old, &committed);
        self.after_commit(&committed, changed, fields).await;

        // Follow-up effects run after the trigger's lock is released so each
        // touches only its own lock — no nested acquisition, no deadlock.
        if committed.status == TaskStatus::Completed && old.status != TaskStatus::Completed {
            self.cascade_completion(id).await;
        }
        let mut groups: Vec<String> = Vec::new();
        if let Some(g) = old.group_id() {
            groups.push(g.to_string());
        }
        if let Some(g) = committed.group_id() {
            if !groups.iter().any(|existing| existing == g) {
                groups.push(g.to_string());
            }
        }
        for group in groups {
            self.recompute_group(&group).await;
        }

        Ok(committed)
    }

    /// Soft-delete. History and the snapshot survive; the task disappears
    /// from queries, cascades, and rollups.
    pub async fn archive(&self, id: &str) -> EngineResult<Task> {
        let guard = self.lock_task(id).await;
        let old = match self.get(id).await {
            Some(task) => task,
            None => return Err(EngineError::NotFound { id: id.to_string() }),
        };
        if old.archived {
            return Ok(old);
        }

        let mut archived = old.clone();
        archived.archived = true;
        archived.touch();

        {
            let mut tasks = self.tasks.write().await;
            let mut graph = self.graph.lock().await;
            graph.unindex_task(&old);
            tasks.insert(id.to_string(), archived.clone());
        }
        drop(guard);

        let mut fields = BTreeMap::new();
        fields.insert("archived".to_string(), Value::Bool(true));
        self.after_commit(&archived, vec!["archived".to_string()], fields)
            .await;
        if let Some(group) = archived.group_id().map(String::from) {
            self.recompute_group(&group).await;
        }
        debug!(task_id = %id, "task archived");
        Ok(archived)
    }

    // ── Patch application ────────────────────────────────────────────────────

    async fn apply_patch(&self, old: &Task, patch: &TaskPatch) -> EngineResult<Task> {
        let mut candidate = old.clone();

        if let Some(label) = &patch.label {
            candidate.label = label.clone();
        }
        if let Some(description) = &patch.description {
            candidate.description = Some(description.clone());
        }
        if let Some(assignee) = &patch.assignee {
            candidate.assignee = assignee.clone();
        }
        if let Some(metadata) = &patch.metadata {
            for (key, value) in metadata {
                candidate.metadata.insert(key.clone(), value.clone());
            }
        }
        if let Some(dependencies) = &patch.dependencies {
            self.check_edges_exist("dependencies", dependencies.iter()).await?;
            candidate.dependencies = dependencies.clone();
        }
        if let Some(blocked_by) = &patch.blocked_by {
            self.check_edges_exist("blocked_by", blocked_by.iter()).await?;
            if old.status == TaskStatus::Completed && !blocked_by.is_empty() {
                return Err(EngineError::Transition {
                    from: old.status.to_string(),
                    to: TaskStatus::Blocked.to_string(),
                });
            }
            candidate.blocked_by = blocked_by.clone();
        }
        if let Some(description) = &patch.add_sub_task {
            candidate.sub_tasks.push(super::model::SubTask::new(description));
        }
        if let Some(sub_id) = &patch.complete_sub_task {
            match candidate.sub_tasks.iter_mut().find(|s| &s.id == sub_id) {
                Some(sub) => sub.completed = true,
                None => {
                    return Err(EngineError::validation(
                        "complete_sub_task",
                        sub_id,
                        "no sub-task with this id",
                    ));
                }
            }
        }

        // Status resolution: an explicit request goes through the state
        // machine; otherwise blocking edges force/release BLOCKED.
        if let Some(requested) = patch.status {
            if candidate.is_group() {
                return Err(EngineError::validation(
                    "status",
                    requested,
                    "group status is derived from members and cannot be set",
                ));
            }
            let statuses = self.dependency_statuses(&candidate).await;
            state::check_transition(&candidate, requested, |dep| statuses.get(dep).copied())?;
            candidate.status = requested;
        }
        if !candidate.blocked_by.is_empty() && candidate.status != TaskStatus::Blocked {
            // A live blocking edge forces BLOCKED.
            state::check_table(candidate.status, TaskStatus::Blocked)?;
            candidate.status = TaskStatus::Blocked;
        } else if candidate.blocked_by.is_empty()
            && candidate.status == TaskStatus::Blocked
            && patch.status.is_none()
            && !old.blocked_by.is_empty()
        {
            // All blockers cleared by this patch: BLOCKED releases to PENDING,
            // never directly to IN_PROGRESS.
            candidate.status = TaskStatus::Pending;
        }

        Ok(candidate)
    }

    async fn check_edges_exist<'a>(
        &self,
        field: &str,
        edges: impl Iterator<Item = &'a String>,
    ) -> EngineResult<()> {
        let tasks = self.tasks.read().await;
        for edge in edges {
            if !tasks.contains_key(edge) {
                return Err(EngineError::validation(
                    field,
                    edge,
                    "references an unknown task",
                ));
            }
        }
        Ok(())
    }

    async fn dependency_statuses(&self, task: &Task) -> HashMap<String, TaskStatus> {
        let tasks = self.tasks.read().await;
        task.dependencies
            .iter()
            .filter_map(|dep| tasks.get(dep).map(|t| (dep.clone(), t.status)))
            .collect()
    }

    // ── Cascade & rollup ─────────────────────────────────────────────────────

    /// Remove a completed blocker from every direct dependent. Dependents
    /// whose `blocked_by` drains auto-transition BLOCKED → PENDING. Touches
    /// only the frontier — never the whole graph.
    async fn cascade_completion(&self, completed_id: &str) {
        let frontier = self.graph.lock().await.frontier(completed_id);
        for dependent_id in frontier {
            let guard = self.lock_task(&dependent_id).await;
            let Some(old) = self.get(&dependent_id).await else {
                continue;
            };
            if old.is_quarantined() || old.archived || !old.blocked_by.contains(completed_id) {
                continue;
            }

            let mut updated = old.clone();
            updated.blocked_by.remove(completed_id);
            if updated.blocked_by.is_empty() && updated.status == TaskStatus::Blocked {
                updated.status = TaskStatus::Pending;
            }
            for event in diff_events(&old, &updated, None) {
                updated.history.record(event);
            }
            updated.touch();

            {
                let mut tasks = self.tasks.write().await;
                let mut graph = self.graph.lock().await;
                graph.reindex(&old, &updated);
                tasks.insert(dependent_id.clone(), updated.clone());
            }
            drop(guard);

            let (changed, fields) = changed_fields(&old, &updated);
            self.after_commit(&updated, changed, fields).await;
            debug!(
                task_id = %dependent_id,
                blocker = %completed_id,
                status = %updated.status,
                "blocking edge cleared by cascade"
            );
            if let Some(group) = updated.group_id().map(String::from) {
                self.recompute_group(&group).await;
            }
        }
    }

    /// Derived rollup: a group is COMPLETED iff every member is COMPLETED.
    /// Locks are taken in the fixed global order — group id before member
    /// ids, members lexicographic — so concurrent member mutations cannot
    /// deadlock against the rollup.
    async fn recompute_group(&self, group_id: &str) {
        let Some(group) = self.get(group_id).await else {
            return;
        };
        if !group.is_group() || group.archived || group.is_quarantined() {
            return;
        }

        let member_ids: Vec<String> = {
            let tasks = self.tasks.read().await;
            let mut ids: Vec<String> = tasks
                .values()
                .filter(|t| t.group_id() == Some(group_id))
                .filter(|t| !t.archived && !t.is_quarantined())
                .map(|t| t.id.clone())
                .collect();
            ids.sort();
            ids
        };

        let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(member_ids.len() + 1);
        guards.push(self.lock_task(group_id).await);
        for member in &member_ids {
            guards.push(self.lock_task(member).await);
        }

        let Some(old) = self.get(group_id).await else {
            return;
        };
        let all_complete = !member_ids.is_empty() && {
            let tasks = self.tasks.read().await;
            member_ids
                .iter()
                .all(|m| tasks.get(m).map(|t| t.status == TaskStatus::Completed) == Some(true))
        };

        let desired = if all_complete {
            TaskStatus::Completed
        } else if old.status == TaskStatus::Completed {
            // A member reopened or a new member appeared: the group reopens.
            TaskStatus::InProgress
        } else {
            drop(guards);
            return;
        };
        if desired == old.status {
            drop(guards);
            return;
        }

        // Route through the state machine so the group journals a normal
        // state_history entry. Transitions without a direct edge in the table
        // hop through IN_PROGRESS.
        let mut updated = old.clone();
        let path: Vec<TaskStatus> = if state::check_table(old.status, desired).is_ok() {
            vec![desired]
        } else {
            vec![TaskStatus::InProgress, desired]
        };
        for step in path {
            if let Err(e) = state::check_table(updated.status, step) {
                warn!(group = %group_id, err = %e, "group rollup transition rejected");
                drop(guards);
                return;
            }
            let before = updated.clone();
            updated.status = step;
            for event in diff_events(&before, &updated, None) {
                updated.history.record(event);
            }
        }
        updated.touch();

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(group_id.to_string(), updated.clone());
        }
        drop(guards);

        let (changed, fields) = changed_fields(&old, &updated);
        self.after_commit(&updated, changed, fields).await;
        debug!(group = %group_id, status = %updated.status, "group rollup recomputed");
    }

    // ── Commit plumbing ──────────────────────────────────────────────────────

    async fn after_commit(
        &self,
        task: &Task,
        changed: Vec<String>,
        fields: BTreeMap<String, Value>,
    ) {
        if let Some(persist) = &self.persist {
            if let Err(e) = persist.save(task).await {
                // Persistence is best-effort — the in-memory authority has
                // already committed.
                warn!(task_id = %task.id, err = %e, "snapshot write failed");
            }
        }
        let delta = CommitDelta {
            task_id: task.id.clone(),
            channels: task.channels(),
            status: task.status,
            updated_at: task.updated_at,
            changed,
            fields,
            task: task.clone(),
        };
        if let Ok(slot) = self.commits.lock() {
            if let Some(tx) = slot.as_ref() {
                let _ = tx.send(delta);
            }
        }
    }

    async fn lock_task(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Names and new values of the top-level fields that differ between two
/// snapshots. The history stream is deliberately excluded — deltas stay
/// minimal and clients fetch full history on demand.
fn changed_fields(old: &Task, new: &Task) -> (Vec<String>, BTreeMap<String, Value>) {
    let old_value = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_value = serde_json::to_value(new).unwrap_or(Value::Null);
    let (Value::Object(old_map), Value::Object(new_map)) = (old_value, new_value) else {
        return (Vec::new(), BTreeMap::new());
    };

    let mut changed = Vec::new();
    let mut fields = BTreeMap::new();
    for (key, new_field) in new_map {
        if key == "history" {
            continue;
        }
        if old_map.get(&key) != Some(&new_field) {
            changed.push(key.clone());
            fields.insert(key, new_field);
        }
    }
    (changed, fields)
}
