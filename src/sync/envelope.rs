//! Wire protocol for the sync transport.
//!
//! Every frame is an envelope `{type, data, timestamp, client_id, channel?}`.
//! The `type`/`data` pair is a closed sum matched exhaustively at the
//! protocol boundary — an unknown `type` is a validation error, never a
//! silent no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult, ErrorPayload};
use crate::tasks::model::{CreateTask, TaskPatch, TaskStatus};
use crate::tasks::query::{SearchRequest, SearchResponse};
use crate::tasks::store::CommitDelta;
use crate::validate;

/// Every message type the protocol knows. Parsing checks against this list
/// before deserializing so an unknown type names itself in the error.
const KNOWN_TYPES: &[&str] = &[
    "connect",
    "connection_success",
    "auth_status",
    "task_update",
    "task_search",
    "task_search_result",
    "join_channel",
    "leave_channel",
    "subscription_success",
    "unsubscription_success",
    "error",
    "disconnect",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Connect {
        api_key: String,
    },
    ConnectionSuccess {
        server_version: String,
        /// True when the server is about to replay full snapshots instead of
        /// buffered deltas.
        #[serde(default)]
        resync: bool,
    },
    AuthStatus {
        status: String,
    },
    TaskUpdate(TaskUpdateData),
    TaskSearch(SearchRequest),
    TaskSearchResult(SearchResponse),
    JoinChannel {
        channel: String,
    },
    LeaveChannel {
        channel: String,
    },
    SubscriptionSuccess {
        channel: String,
    },
    UnsubscriptionSuccess {
        channel: String,
    },
    Error(ErrorPayload),
    Disconnect,
}

/// `task_update` data is directional: inbound frames carry a command
/// (distinguished by its `action` tag), outbound frames carry a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskUpdateData {
    Command(TaskCommand),
    Delta(TaskDelta),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskCommand {
    Create {
        #[serde(flatten)]
        task: CreateTask,
    },
    Update {
        id: String,
        patch: TaskPatch,
    },
    Archive {
        id: String,
    },
}

/// Minimal outbound delta describing one committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDelta {
    pub id: String,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    pub changed: Vec<String>,
    pub fields: BTreeMap<String, Value>,
    /// Set on full-resync delivery; `fields` then holds the whole snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resync: bool,
}

impl TaskDelta {
    pub fn from_commit(commit: &CommitDelta) -> Self {
        Self {
            id: commit.task_id.clone(),
            status: commit.status,
            updated_at: commit.updated_at,
            changed: commit.changed.clone(),
            fields: commit.fields.clone(),
            resync: false,
        }
    }

    /// Full-snapshot delta used when a reconnecting client's backlog
    /// overflowed and replay is no longer possible.
    pub fn resync_snapshot(task: &crate::tasks::model::Task) -> Self {
        let fields = match serde_json::to_value(task) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Self {
            id: task.id.clone(),
            status: task.status,
            updated_at: task.updated_at,
            changed: vec!["*".to_string()],
            fields,
            resync: true,
        }
    }
}

/// The outer frame around every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    /// ISO-8601. Kept as a string on the wire so malformed values are
    /// rejected by the gate with the field named, not by serde.
    pub timestamp: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Envelope {
    pub fn new(message: Message, client_id: &str) -> Self {
        Self {
            message,
            timestamp: Utc::now().to_rfc3339(),
            client_id: client_id.to_string(),
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    /// Parse and gate one inbound frame. All-or-nothing: any failure yields
    /// a `ValidationError` naming the first failing field, and nothing
    /// reaches the store.
    pub fn parse(text: &str) -> EngineResult<Self> {
        let raw: Value = serde_json::from_str(text).map_err(|e| {
            EngineError::validation("message", text_preview(text), &format!("not valid JSON: {}", e))
        })?;

        let message_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| EngineError::validation("type", &raw, "missing message type"))?;
        if !KNOWN_TYPES.contains(&message_type.as_str()) {
            return Err(EngineError::validation(
                "type",
                message_type,
                "unknown message type",
            ));
        }

        let envelope: Envelope = serde_json::from_value(raw).map_err(|e| {
            EngineError::validation("data", &message_type, &format!("malformed payload: {}", e))
        })?;

        validate::validate_timestamp("timestamp", &envelope.timestamp)?;
        if envelope.client_id.is_empty() {
            return Err(EngineError::validation("client_id", "", "must not be empty"));
        }

        // Message-specific gates run before dispatch.
        match &envelope.message {
            Message::TaskUpdate(TaskUpdateData::Command(command)) => match command {
                TaskCommand::Create { task } => validate::validate_create(task)?,
                TaskCommand::Update { id, patch } => validate::validate_patch(id, patch)?,
                TaskCommand::Archive { id } => validate::validate_id("id", id)?,
            },
            Message::TaskSearch(request) => validate::validate_search(request)?,
            Message::JoinChannel { channel } | Message::LeaveChannel { channel } => {
                validate::validate_channel_name(channel)?;
            }
            _ => {}
        }

        Ok(envelope)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn text_preview(text: &str) -> &str {
    // Truncate on a char boundary; byte 80 may fall inside a multi-byte char.
    match text.char_indices().nth(80) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
