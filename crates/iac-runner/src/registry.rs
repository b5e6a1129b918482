// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task Registry
//!
//! Single authority mapping a task identity to its [`TaskHandle`]. The map
//! itself is only write-locked to insert or remove entries; every handle sits
//! behind its own mutex so polls and transitions on unrelated tasks never
//! contend.
//!
//! Status changes are persisted as `task.json` in the task workspace, which lets
//! a restarted runner reload its history with [`TaskRegistry::recover`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runner::{LaunchHandle, Launcher, Outcome};
use crate::task::{TaskHandle, TaskStatus};
use crate::workspace::{SNAPSHOT_FILE_NAME, WorkspaceManager};

/// Failure reason recorded for tasks interrupted by a runner restart.
pub const RESTARTED_REASON: &str = "runner restarted";

/// In-memory task registry with per-task locking.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskHandle>>>>,
    workspaces: WorkspaceManager,
}

impl TaskRegistry {
    /// Create an empty registry persisting snapshots under `workspaces`.
    pub fn new(workspaces: WorkspaceManager) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            workspaces,
        }
    }

    async fn entry(&self, task_id: &str) -> Result<Arc<Mutex<TaskHandle>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Register a new handle. Fails if the task identity is already known.
    pub async fn register(&self, handle: TaskHandle) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&handle.task_id) {
            return Err(Error::TaskExists(handle.task_id.clone()));
        }
        debug!(task_id = %handle.task_id, template_id = %handle.template_id, "Registered task");
        tasks.insert(handle.task_id.clone(), Arc::new(Mutex::new(handle)));
        Ok(())
    }

    /// Snapshot of a handle.
    pub async fn lookup(&self, task_id: &str) -> Result<TaskHandle> {
        let entry = self.entry(task_id).await?;
        let handle = entry.lock().await;
        Ok(handle.clone())
    }

    /// Whether a task identity is known.
    pub async fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().await.contains_key(task_id)
    }

    /// Move the delivered log offset forward. Returns the resulting offset,
    /// which never decreases.
    pub async fn advance_offset(&self, task_id: &str, new_offset: usize) -> Result<usize> {
        let entry = self.entry(task_id).await?;
        let mut handle = entry.lock().await;
        handle.log_offset = handle.log_offset.max(new_offset);
        Ok(handle.log_offset)
    }

    /// Record that the execution unit has started.
    ///
    /// Ignored if the task already left `not-started`.
    pub async fn mark_running(&self, task_id: &str, container_id: &str) -> Result<TaskHandle> {
        let entry = self.entry(task_id).await?;
        let mut handle = entry.lock().await;
        if handle.status.can_transition_to(TaskStatus::Running) {
            handle.status = TaskStatus::Running;
            handle.container_id = Some(container_id.to_string());
            handle.started_at = Some(Utc::now());
            self.persist(&handle).await;
        }
        Ok(handle.clone())
    }

    /// Commit a terminal outcome.
    ///
    /// Terminal states are sinks: if the task is already terminal the existing
    /// record is kept and returned unchanged.
    pub async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<TaskHandle> {
        let entry = self.entry(task_id).await?;
        let mut handle = entry.lock().await;
        if handle.status.can_transition_to(outcome.status) {
            handle.status = outcome.status;
            handle.exit_code = outcome.exit_code;
            handle.error = outcome.error;
            handle.finished_at = Some(Utc::now());
            self.persist(&handle).await;
            info!(
                task_id = %handle.task_id,
                template_id = %handle.template_id,
                status = %handle.status,
                exit_code = ?handle.exit_code,
                "Task finished"
            );
        } else {
            debug!(
                task_id = %handle.task_id,
                current = %handle.status,
                ignored = %outcome.status,
                "Ignoring transition out of terminal state"
            );
        }
        Ok(handle.clone())
    }

    /// Record the task as failed with a reason.
    pub async fn fail(&self, task_id: &str, reason: impl Into<String>) -> Result<TaskHandle> {
        self.finish(
            task_id,
            Outcome {
                status: TaskStatus::Failed,
                exit_code: None,
                error: Some(reason.into()),
            },
        )
        .await
    }

    /// Drop a handle from the registry. The workspace is left alone.
    pub async fn remove(&self, task_id: &str) -> Option<TaskHandle> {
        let entry = self.tasks.write().await.remove(task_id)?;
        let handle = entry.lock().await;
        Some(handle.clone())
    }

    /// Snapshots of all handles.
    pub async fn list(&self) -> Vec<TaskHandle> {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            handles.push(entry.lock().await.clone());
        }
        handles
    }

    /// Terminal handles that finished before `cutoff`.
    pub async fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskHandle> {
        self.list()
            .await
            .into_iter()
            .filter(|h| h.status.is_terminal() && h.finished_at.is_some_and(|t| t < cutoff))
            .collect()
    }

    /// Write the handle snapshot into its workspace. Failures are logged, not
    /// propagated: the in-memory record stays authoritative.
    async fn persist(&self, handle: &TaskHandle) {
        if let Err(e) = self.write_snapshot(handle).await {
            warn!(task_id = %handle.task_id, error = %e, "Failed to persist task snapshot");
        }
    }

    async fn write_snapshot(&self, handle: &TaskHandle) -> Result<()> {
        let path = self.workspaces.snapshot_path(&handle.key());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(handle)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Reload persisted snapshots from the storage root.
    ///
    /// Tasks that were still running when the previous runner died are killed
    /// through `launcher` (best effort) and recorded as failed. Returns the
    /// number of tasks loaded.
    pub async fn recover(&self, launcher: &dyn Launcher) -> Result<usize> {
        let mut loaded = 0;
        for path in snapshot_files(&self.workspaces).await? {
            let mut handle: TaskHandle = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable task snapshot");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read task snapshot");
                    continue;
                }
            };

            if !handle.status.is_terminal() {
                if let Some(container_id) = &handle.container_id {
                    let launch_handle = LaunchHandle {
                        handle_id: container_id.clone(),
                        task_id: handle.task_id.clone(),
                        started_at: handle.started_at.unwrap_or(handle.created_at),
                        pid: None,
                    };
                    if let Err(e) = launcher.cancel(&launch_handle).await {
                        warn!(task_id = %handle.task_id, error = %e, "Failed to kill orphaned execution unit");
                    }
                    let _ = launcher.release(&launch_handle).await;
                }
                handle.status = TaskStatus::Failed;
                handle.error = Some(RESTARTED_REASON.to_string());
                handle.finished_at = Some(Utc::now());
                self.persist(&handle).await;
                warn!(task_id = %handle.task_id, "Recovered interrupted task as failed");
            }

            match self.register(handle).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping duplicate task snapshot"),
            }
        }

        if loaded > 0 {
            info!(count = loaded, "Recovered tasks from storage");
        }
        Ok(loaded)
    }
}

/// Paths of `{root}/{template}/{task}/task.json` files that exist.
async fn snapshot_files(workspaces: &WorkspaceManager) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let mut templates = match tokio::fs::read_dir(workspaces.root()).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(template) = templates.next_entry().await? {
        if !template.file_type().await?.is_dir() {
            continue;
        }
        let mut tasks = tokio::fs::read_dir(template.path()).await?;
        while let Some(task) = tasks.next_entry().await? {
            let snapshot = task.path().join(SNAPSHOT_FILE_NAME);
            if tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
                files.push(snapshot);
            }
        }
    }
    Ok(files)
}
