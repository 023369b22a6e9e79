//! Legal status-transition table plus transition-time invariant checks.
//!
//! A rejected transition leaves the task untouched and produces no journal
//! entry — rejections happen before anything reaches the store.

use crate::error::{EngineError, EngineResult};

use super::model::{Task, TaskStatus};

/// Returns the statuses reachable from `from` in one step.
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[InProgress, Blocked],
        InProgress => &[Blocked, Completed, Pending],
        Blocked => &[Pending, InProgress],
        // Reopen is the only way out of Completed.
        Completed => &[InProgress],
    }
}

/// Check a requested transition against the table only. A same-status request
/// is accepted as a no-op (the store treats it as idempotent).
pub fn check_table(from: TaskStatus, to: TaskStatus) -> EngineResult<()> {
    if from == to || allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::Transition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Full transition check for a task: the table, plus the completion guards.
///
/// A transition to COMPLETED is rejected — independent of the table — while
/// any dependency is not itself COMPLETED or any blocking edge exists.
/// `dependency_status` resolves a dependency id to its current status
/// (`None` for a tombstoned/unknown id, which does not block completion).
pub fn check_transition<F>(task: &Task, to: TaskStatus, dependency_status: F) -> EngineResult<()>
where
    F: Fn(&str) -> Option<TaskStatus>,
{
    check_table(task.status, to)?;

    if to == TaskStatus::Completed && task.status != TaskStatus::Completed {
        if let Some(blocker) = task.blocked_by.iter().next() {
            return Err(EngineError::Dependency {
                task_id: task.id.clone(),
                unmet: format!("blocked by '{}'", blocker),
            });
        }
        for dep in &task.dependencies {
            match dependency_status(dep) {
                Some(TaskStatus::Completed) | None => {}
                Some(status) => {
                    return Err(EngineError::Dependency {
                        task_id: task.id.clone(),
                        unmet: format!("dependency '{}' is {}", dep, status),
                    });
                }
            }
        }
    }

    Ok(())
}
