//! Filter/sort/paginate reads over the task store.
//!
//! Queries run against a read snapshot and never touch store state. A newer
//! query from the same client supersedes any still-in-flight one
//! (last-request-wins); a superseded query's result is discarded before it
//! can be applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::model::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

/// Filters AND across categories and OR within a category's array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    pub status: Vec<TaskStatus>,
    /// Matched against the `metadata.priority` scalar.
    pub priority: Vec<String>,
    pub assignee: Vec<String>,
    #[serde(rename = "dateRange", skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Label,
    Status,
    Id,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            "label" => Some(Self::Label),
            "status" => Some(Self::Status),
            "id" => Some(Self::Id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    #[serde(rename = "pageSize")]
    pub page_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<SearchFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<Task>,
    #[serde(rename = "totalItems")]
    pub total_items: usize,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
}

/// Executes searches with per-client last-request-wins cancellation.
#[derive(Debug, Default)]
pub struct QueryEngine {
    /// client id → generation of the most recent query.
    generations: Mutex<HashMap<String, u64>>,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a validated search over a read snapshot.
    ///
    /// Returns `None` when a newer query from the same client superseded this
    /// one while it ran — the caller must not send a result in that case.
    pub async fn run(
        &self,
        client_id: &str,
        request: &SearchRequest,
        snapshot: Vec<Task>,
    ) -> Option<SearchResponse> {
        let generation = {
            let mut generations = self.generations.lock().await;
            let entry = generations.entry(client_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let mut matched: Vec<Task> = snapshot
            .into_iter()
            .filter(|task| matches(task, request))
            .collect();
        sort_tasks(&mut matched, request.sort.as_ref());

        // Suspension point: later queries from this client get a chance to
        // register before the result is finalized.
        tokio::task::yield_now().await;

        let total_items = matched.len();
        let page_size = request.pagination.page_size.max(1);
        let total_pages = (total_items as u64).div_ceil(page_size);
        // A page far past the end is an empty page, never an overflow.
        let start = (request.pagination.page.saturating_sub(1))
            .saturating_mul(page_size)
            .min(total_items as u64) as usize;
        let items: Vec<Task> = matched
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();

        let current = self
            .generations
            .lock()
            .await
            .get(client_id)
            .copied()
            .unwrap_or(0);
        if current != generation {
            tracing::debug!(client_id, generation, current, "search superseded — dropping result");
            return None;
        }

        Some(SearchResponse {
            items,
            total_items,
            total_pages,
        })
    }
}

fn matches(task: &Task, request: &SearchRequest) -> bool {
    if task.archived || task.is_quarantined() {
        return false;
    }

    if let Some(text) = request.text.as_deref().filter(|t| !t.is_empty()) {
        let needle = text.to_lowercase();
        let in_label = task.label.to_lowercase().contains(&needle);
        let in_description = task
            .description
            .as_deref()
            .map(|d| d.to_lowercase().contains(&needle))
            .unwrap_or(false);
        if !in_label && !in_description {
            return false;
        }
    }

    let Some(filter) = &request.filter else {
        return true;
    };

    if !filter.status.is_empty() && !filter.status.contains(&task.status) {
        return false;
    }

    if !filter.priority.is_empty() {
        let priority = task
            .metadata
            .get("priority")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        if !filter.priority.contains(&priority) {
            return false;
        }
    }

    if !filter.assignee.is_empty() {
        match &task.assignee {
            Some(assignee) if filter.assignee.contains(assignee) => {}
            _ => return false,
        }
    }

    if let Some(range) = &filter.date_range {
        if let Some(from) = range.from {
            if task.created_at < from {
                return false;
            }
        }
        if let Some(to) = range.to {
            if task.created_at > to {
                return false;
            }
        }
    }

    true
}

fn sort_tasks(tasks: &mut [Task], sort: Option<&SortSpec>) {
    let Some(spec) = sort else {
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        return;
    };
    let field = SortField::parse(&spec.field).unwrap_or(SortField::CreatedAt);
    tasks.sort_by(|a, b| {
        let ordering = match field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::Label => a.label.to_lowercase().cmp(&b.label.to_lowercase()),
            SortField::Status => a.status.to_string().cmp(&b.status.to_string()),
            SortField::Id => a.id.cmp(&b.id),
        };
        match spec.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}
