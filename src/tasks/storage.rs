//! Snapshot persistence — one JSON file per task under `{data_dir}/tasks/`.
//!
//! The in-memory store is the authority; snapshots are written best-effort
//! after each commit and loaded once at startup. A corrupt or unreadable
//! snapshot is fatal for that task only: it loads as a quarantined
//! placeholder (`system_state: error`) and never aborts the rest of the load.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::model::{SystemState, Task};

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("tasks"),
        }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// Write a task snapshot. Uses a write-then-rename so a crash mid-write
    /// never leaves a truncated snapshot behind.
    pub async fn save(&self, task: &Task) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(&task.id);
        let tmp = self.dir.join(format!("{}.json.tmp", task.id));
        let body = serde_json::to_vec_pretty(task)?;
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Load every snapshot in the directory. Corrupt files are quarantined in
    /// place and returned as placeholder tasks.
    pub async fn load_all(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tasks),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.dir.display()));
            }
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(task_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
            else {
                continue;
            };

            match read_snapshot(&path).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        path = %path.display(),
                        err = %e,
                        "corrupt task snapshot — quarantining"
                    );
                    tasks.push(quarantined_placeholder(&task_id));
                }
            }
        }

        info!(count = tasks.len(), dir = %self.dir.display(), "task snapshots loaded");
        Ok(tasks)
    }
}

async fn read_snapshot(path: &Path) -> Result<Task> {
    let bytes = tokio::fs::read(path).await?;
    let task: Task = serde_json::from_slice(&bytes)?;
    if task.id.is_empty() || task.label.is_empty() {
        anyhow::bail!("snapshot has an empty id or label");
    }
    Ok(task)
}

/// A placeholder for a task whose snapshot could not be read. Excluded from
/// cascades, rollups, and queries until manually repaired.
fn quarantined_placeholder(task_id: &str) -> Task {
    let mut task = Task::new(task_id, "<unreadable snapshot>");
    task.system_state = SystemState::Error;
    task
}
