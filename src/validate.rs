//! Schema checks applied to every inbound message before it can reach the
//! store. Validation is all-or-nothing: the first failing field aborts the
//! whole message and nothing is partially applied.

use chrono::DateTime;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::tasks::model::{CreateTask, TaskPatch};
use crate::tasks::query::SearchRequest;

const MAX_ID_LEN: usize = 64;

/// Task ids: 1-64 chars, alphanumeric plus `-` and `_`. The charset keeps ids
/// safe for use in snapshot file names.
pub fn validate_id(field: &str, id: &str) -> EngineResult<()> {
    if id.is_empty() {
        return Err(EngineError::validation(field, id, "must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::validation(field, id, "must be at most 64 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::validation(
            field,
            id,
            "only alphanumeric characters, hyphens, and underscores are allowed",
        ));
    }
    Ok(())
}

/// Channel names are scoped ids like `domain:personal` or `task:t1` — the
/// task-id charset plus a single `:` separator.
pub fn validate_channel_name(channel: &str) -> EngineResult<()> {
    let mut parts = channel.splitn(2, ':');
    let scope = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    if scope.is_empty() || name.is_empty() {
        return Err(EngineError::InvalidChannel {
            channel: channel.to_string(),
        });
    }
    if validate_id("channel", scope).is_err() || validate_id("channel", name).is_err() {
        return Err(EngineError::InvalidChannel {
            channel: channel.to_string(),
        });
    }
    Ok(())
}

pub fn validate_label(field: &str, label: &str) -> EngineResult<()> {
    if label.trim().is_empty() {
        Err(EngineError::validation(field, label, "must not be empty"))
    } else {
        Ok(())
    }
}

/// Timestamps on the wire must be ISO-8601 (RFC 3339).
pub fn validate_timestamp(field: &str, value: &str) -> EngineResult<()> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|_| EngineError::validation(field, value, "must be an ISO-8601 timestamp"))
}

/// Metadata values must be JSON-serializable scalars/objects/arrays. A `null`
/// is the wire image of an unserializable value and is rejected, including
/// nested inside objects and arrays.
pub fn validate_metadata(field: &str, metadata: &BTreeMap<String, Value>) -> EngineResult<()> {
    for (key, value) in metadata {
        if contains_null(value) {
            return Err(EngineError::validation(
                &format!("{}.{}", field, key),
                value,
                "metadata values must be JSON-serializable and non-null",
            ));
        }
    }
    Ok(())
}

fn contains_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().any(contains_null),
        Value::Object(map) => map.values().any(contains_null),
        _ => false,
    }
}

pub fn validate_pagination(page: u64, page_size: u64) -> EngineResult<()> {
    if page == 0 {
        return Err(EngineError::validation("pagination.page", page, "must be positive"));
    }
    if page_size == 0 {
        return Err(EngineError::validation(
            "pagination.pageSize",
            page_size,
            "must be positive",
        ));
    }
    Ok(())
}

/// Gate for a task creation message.
pub fn validate_create(create: &CreateTask) -> EngineResult<()> {
    validate_id("id", &create.id)?;
    validate_label("label", &create.label)?;
    validate_metadata("metadata", &create.metadata)?;
    for dep in &create.dependencies {
        validate_id("dependencies", dep)?;
    }
    for blocker in &create.blocked_by {
        validate_id("blocked_by", blocker)?;
    }
    if create.dependencies.contains(&create.id) || create.blocked_by.contains(&create.id) {
        return Err(EngineError::validation(
            "dependencies",
            &create.id,
            "a task cannot depend on or be blocked by itself",
        ));
    }
    Ok(())
}

/// Gate for a partial task update.
pub fn validate_patch(id: &str, patch: &TaskPatch) -> EngineResult<()> {
    validate_id("id", id)?;
    if let Some(label) = &patch.label {
        validate_label("label", label)?;
    }
    if let Some(metadata) = &patch.metadata {
        validate_metadata("metadata", metadata)?;
    }
    for dep in patch.dependencies.iter().flatten() {
        validate_id("dependencies", dep)?;
        if dep == id {
            return Err(EngineError::validation(
                "dependencies",
                dep,
                "a task cannot depend on itself",
            ));
        }
    }
    for blocker in patch.blocked_by.iter().flatten() {
        validate_id("blocked_by", blocker)?;
        if blocker == id {
            return Err(EngineError::validation(
                "blocked_by",
                blocker,
                "a task cannot block itself",
            ));
        }
    }
    if let Some(description) = &patch.add_sub_task {
        validate_label("add_sub_task", description)?;
    }
    if let Some(comment) = &patch.add_comment {
        validate_label("add_comment.content", &comment.content)?;
        validate_label("add_comment.author", &comment.author)?;
    }
    if let Some(edit) = &patch.edit_comment {
        validate_label("edit_comment.content", &edit.content)?;
    }
    if let Some(interaction) = &patch.agent_interaction {
        validate_label("agent_interaction.type", &interaction.interaction_type)?;
    }
    Ok(())
}

/// Gate for a `task_search` request.
pub fn validate_search(request: &SearchRequest) -> EngineResult<()> {
    validate_pagination(request.pagination.page, request.pagination.page_size)?;
    if let Some(filter) = &request.filter {
        if let Some(range) = &filter.date_range {
            if let (Some(from), Some(to)) = (&range.from, &range.to) {
                if from > to {
                    return Err(EngineError::validation(
                        "filter.dateRange",
                        format!("{}..{}", from, to),
                        "'from' must not be after 'to'",
                    ));
                }
            }
        }
    }
    if let Some(sort) = &request.sort {
        crate::tasks::query::SortField::parse(&sort.field).ok_or_else(|| {
            EngineError::validation("sort.field", &sort.field, "unknown sort field")
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::query::{Pagination, SearchRequest};

    #[test]
    fn test_empty_and_oversized_ids_rejected() {
        assert!(validate_id("id", "").is_err());
        assert!(validate_id("id", &"x".repeat(65)).is_err());
        assert!(validate_id("id", "task-001_a").is_ok());
        assert!(validate_id("id", "../escape").is_err());
    }

    #[test]
    fn test_timestamp_must_be_iso8601() {
        assert!(validate_timestamp("timestamp", "2026-08-30T12:00:00Z").is_ok());
        assert!(validate_timestamp("timestamp", "yesterday").is_err());
        assert!(validate_timestamp("timestamp", "1756555200").is_err());
    }

    #[test]
    fn test_metadata_nulls_rejected_even_nested() {
        let mut metadata = BTreeMap::new();
        metadata.insert("ok".to_string(), serde_json::json!({"a": [1, 2]}));
        assert!(validate_metadata("metadata", &metadata).is_ok());

        metadata.insert("bad".to_string(), serde_json::json!({"a": [1, null]}));
        let err = validate_metadata("metadata", &metadata).unwrap_err();
        assert!(err.to_string().contains("metadata.bad"));
    }

    #[test]
    fn test_pagination_must_be_positive() {
        assert!(validate_pagination(0, 10).is_err());
        assert!(validate_pagination(1, 0).is_err());
        assert!(validate_pagination(1, 25).is_ok());
    }

    #[test]
    fn test_self_edges_rejected() {
        let mut create = crate::tasks::model::CreateTask::new("t1", "Label");
        create.blocked_by.insert("t1".to_string());
        assert!(validate_create(&create).is_err());
    }

    #[test]
    fn test_search_gate_accepts_default_request() {
        let request = SearchRequest {
            text: Some("meeting".to_string()),
            filter: None,
            sort: None,
            pagination: Pagination { page: 1, page_size: 20 },
        };
        assert!(validate_search(&request).is_ok());
    }
}
