use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::history::TaskHistory;

/// The finite set of statuses a task can be in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown status '{}'", s))
    }
}

/// Whether a task is an individual work item or a rollup container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Task,
    Group,
}

/// Health of the persisted record backing a task.
///
/// `Error` marks a task whose snapshot was unreadable or invalid on load.
/// Such tasks are excluded from cascades and group rollups until repaired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    #[default]
    Healthy,
    Error,
}

/// A checklist item owned exclusively by its parent task. Not independently
/// addressable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    pub id: String,
    pub description: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl SubTask {
    pub fn new(description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            completed: false,
            created_at: Utc::now(),
        }
    }
}

/// The atomic unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Access-control partition (e.g. personal vs. professional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Monotonic non-decreasing per task.
    pub updated_at: DateTime<Utc>,
    /// Arbitrary string-keyed map. Values are JSON-serializable only; the
    /// validation gate rejects nulls before they reach the store.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Tasks this one cannot complete before (dependency edges).
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Tasks that force this one into BLOCKED while the edge exists.
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub history: TaskHistory,
    /// Soft-delete flag. Archived tasks keep their history and snapshot but
    /// are excluded from queries and cascades.
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub system_state: SystemState,
}

impl Task {
    /// Build a fresh task in the given (or default PENDING) initial status.
    pub fn new(id: &str, label: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            label: label.to_string(),
            kind: TaskKind::Task,
            status: TaskStatus::Pending,
            description: None,
            domain: None,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            sub_tasks: Vec::new(),
            assignee: None,
            history: TaskHistory::default(),
            archived: false,
            system_state: SystemState::Healthy,
        }
    }

    /// The owning group's id, if this task is a group member.
    pub fn group_id(&self) -> Option<&str> {
        self.metadata.get("group_id").and_then(Value::as_str)
    }

    pub fn is_group(&self) -> bool {
        self.kind == TaskKind::Group
    }

    /// Quarantined tasks never participate in cascades or rollups.
    pub fn is_quarantined(&self) -> bool {
        self.system_state == SystemState::Error
    }

    /// Bump `updated_at`, clamped so it never moves backwards even if the
    /// wall clock does.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now.max(self.updated_at);
    }

    /// Channels a commit to this task is published on: the domain scope and
    /// the task's own scope.
    pub fn channels(&self) -> Vec<String> {
        vec![
            format!("domain:{}", self.domain.as_deref().unwrap_or("default")),
            format!("task:{}", self.id),
        ]
    }
}

/// A new comment carried inside a task update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewComment {
    pub content: String,
    pub author: String,
}

/// An in-place edit to an existing comment. Flips the `edited` flag; the
/// original timestamp is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentEdit {
    pub id: String,
    pub content: String,
}

/// A recorded agent interaction carried inside a task update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionInput {
    #[serde(rename = "type")]
    pub interaction_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Partial update applied to an existing task. Every field is optional;
/// absent fields leave the task untouched.
///
/// `assignee` distinguishes "absent" (no change) from "null" (unassign) via
/// the double-option encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPatch {
    pub label: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub assignee: Option<Option<String>>,
    /// Optional reason recorded in the assignment history.
    pub assignment_reason: Option<String>,
    /// Keys to merge into the task metadata (provided keys overwrite).
    pub metadata: Option<BTreeMap<String, Value>>,
    pub dependencies: Option<BTreeSet<String>>,
    pub blocked_by: Option<BTreeSet<String>>,
    /// Description of a sub-task to append.
    pub add_sub_task: Option<String>,
    /// Id of an owned sub-task to mark completed.
    pub complete_sub_task: Option<String>,
    pub add_comment: Option<NewComment>,
    pub edit_comment: Option<CommentEdit>,
    pub agent_interaction: Option<InteractionInput>,
}

impl TaskPatch {
    /// A patch that only requests a status change.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Fields accepted by a validated creation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub id: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: TaskKind,
    /// Initial status; defaults to PENDING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl CreateTask {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            kind: TaskKind::Task,
            status: None,
            description: None,
            domain: None,
            metadata: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            assignee: None,
        }
    }

    pub fn into_task(self) -> Task {
        let mut task = Task::new(&self.id, &self.label);
        task.kind = self.kind;
        task.status = self.status.unwrap_or(TaskStatus::Pending);
        task.description = self.description;
        task.domain = self.domain;
        task.metadata = self.metadata;
        task.dependencies = self.dependencies;
        task.blocked_by = self.blocked_by;
        task.assignee = self.assignee;
        task
    }
}

/// Serde helper distinguishing a missing field from an explicit JSON null.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
