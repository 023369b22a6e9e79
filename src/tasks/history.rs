//! Append-only per-task audit journal.
//!
//! Four independent event streams plus agent interactions. Streams only ever
//! grow; the single permitted in-place mutation is flipping a comment's
//! `edited` flag (with its content) — the original timestamp stays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub content: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub edited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentChange {
    pub from: Option<String>,
    /// `None` records an unassignment.
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInteraction {
    #[serde(rename = "type")]
    pub interaction_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One event produced by diffing two task snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    State(StateChange),
    Update(FieldChange),
    Assignment(AssignmentChange),
}

/// The per-task journal. All streams are append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskHistory {
    #[serde(default)]
    pub state_history: Vec<StateChange>,
    #[serde(default)]
    pub update_history: Vec<FieldChange>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub assignment_history: Vec<AssignmentChange>,
    #[serde(default)]
    pub agent_interactions: Vec<AgentInteraction>,
}

impl TaskHistory {
    /// Route a diff event to its stream.
    pub fn record(&mut self, event: HistoryEvent) {
        match event {
            HistoryEvent::State(e) => self.state_history.push(e),
            HistoryEvent::Update(e) => self.update_history.push(e),
            HistoryEvent::Assignment(e) => self.assignment_history.push(e),
        }
    }

    /// Append a comment and return its generated id.
    pub fn add_comment(&mut self, content: &str, author: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.comments.push(Comment {
            id: id.clone(),
            content: content.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
            edited: false,
        });
        id
    }

    /// Edit a comment in place. Content is replaced, `edited` flips, the
    /// original timestamp is kept. Returns false if the id is unknown.
    pub fn edit_comment(&mut self, id: &str, content: &str) -> bool {
        match self.comments.iter_mut().find(|c| c.id == id) {
            Some(comment) => {
                comment.content = content.to_string();
                comment.edited = true;
                true
            }
            None => false,
        }
    }

    pub fn add_interaction(&mut self, interaction_type: &str, content: &str, context: Option<&str>) {
        self.agent_interactions.push(AgentInteraction {
            interaction_type: interaction_type.to_string(),
            content: content.to_string(),
            context: context.map(String::from),
            timestamp: Utc::now(),
        });
    }

    /// Total entries across every stream. Used by the idempotence checks.
    pub fn total_entries(&self) -> usize {
        self.state_history.len()
            + self.update_history.len()
            + self.comments.len()
            + self.assignment_history.len()
            + self.agent_interactions.len()
    }
}

/// Pure diff of two task snapshots into journal events.
///
/// `assignment_reason` is threaded through from the originating patch so the
/// assignment stream can record why an assignee changed; it does not affect
/// which events are produced.
pub fn diff_events(old: &Task, new: &Task, assignment_reason: Option<&str>) -> Vec<HistoryEvent> {
    let now = Utc::now();
    let mut events = Vec::new();

    if old.status != new.status {
        events.push(HistoryEvent::State(StateChange {
            from: old.status,
            to: new.status,
            timestamp: now,
        }));
    }

    if old.assignee != new.assignee {
        events.push(HistoryEvent::Assignment(AssignmentChange {
            from: old.assignee.clone(),
            to: new.assignee.clone(),
            reason: assignment_reason.map(String::from),
            timestamp: now,
        }));
    }

    let mut field = |name: &str, from: Value, to: Value| {
        if from != to {
            events.push(HistoryEvent::Update(FieldChange {
                field: name.to_string(),
                from,
                to,
                timestamp: now,
            }));
        }
    };

    field("label", json_str(&old.label), json_str(&new.label));
    field(
        "description",
        opt_str(old.description.as_deref()),
        opt_str(new.description.as_deref()),
    );
    field(
        "dependencies",
        serde_json::to_value(&old.dependencies).unwrap_or(Value::Null),
        serde_json::to_value(&new.dependencies).unwrap_or(Value::Null),
    );
    field(
        "blocked_by",
        serde_json::to_value(&old.blocked_by).unwrap_or(Value::Null),
        serde_json::to_value(&new.blocked_by).unwrap_or(Value::Null),
    );
    field(
        "sub_tasks",
        serde_json::to_value(&old.sub_tasks).unwrap_or(Value::Null),
        serde_json::to_value(&new.sub_tasks).unwrap_or(Value::Null),
    );

    // Metadata diffs are recorded per key so the journal stays readable.
    let keys: std::collections::BTreeSet<&String> =
        old.metadata.keys().chain(new.metadata.keys()).collect();
    for key in keys {
        let from = old.metadata.get(key).cloned().unwrap_or(Value::Null);
        let to = new.metadata.get(key).cloned().unwrap_or(Value::Null);
        field(&format!("metadata.{}", key), from, to);
    }

    events
}

fn json_str(s: &str) -> Value {
    Value::String(s.to_string())
}

fn opt_str(s: Option<&str>) -> Value {
    s.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::Task;

    #[test]
    fn test_identical_tasks_diff_to_nothing() {
        let task = Task::new("t1", "Label");
        assert!(diff_events(&task, &task, None).is_empty());
    }

    #[test]
    fn test_status_change_produces_single_state_event() {
        let old = Task::new("t1", "Label");
        let mut new = old.clone();
        new.status = TaskStatus::InProgress;
        let events = diff_events(&old, &new, None);
        assert_eq!(events.len(), 1);
        match &events[0] {
            HistoryEvent::State(change) => {
                assert_eq!(change.from, TaskStatus::Pending);
                assert_eq!(change.to, TaskStatus::InProgress);
            }
            other => panic!("expected state event, got {:?}", other),
        }
    }

    #[test]
    fn test_assignment_change_carries_reason() {
        let old = Task::new("t1", "Label");
        let mut new = old.clone();
        new.assignee = Some("dana".to_string());
        let events = diff_events(&old, &new, Some("on-call rotation"));
        assert_eq!(events.len(), 1);
        match &events[0] {
            HistoryEvent::Assignment(change) => {
                assert_eq!(change.to.as_deref(), Some("dana"));
                assert_eq!(change.reason.as_deref(), Some("on-call rotation"));
            }
            other => panic!("expected assignment event, got {:?}", other),
        }
    }

    #[test]
    fn test_metadata_diff_is_per_key() {
        let old = Task::new("t1", "Label");
        let mut new = old.clone();
        new.metadata
            .insert("priority".to_string(), Value::String("high".to_string()));
        new.metadata
            .insert("sprint".to_string(), Value::String("12".to_string()));
        let events = diff_events(&old, &new, None);
        let fields: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::Update(change) => Some(change.field.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fields, vec!["metadata.priority", "metadata.sprint"]);
    }

    #[test]
    fn test_comment_edit_keeps_timestamp_and_flips_flag() {
        let mut history = TaskHistory::default();
        let id = history.add_comment("first draft", "dana");
        let original_ts = history.comments[0].timestamp;

        assert!(history.edit_comment(&id, "second draft"));
        assert_eq!(history.comments[0].content, "second draft");
        assert!(history.comments[0].edited);
        assert_eq!(history.comments[0].timestamp, original_ts);

        assert!(!history.edit_comment("no-such-id", "x"));
    }
}
