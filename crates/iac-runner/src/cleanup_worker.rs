// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reclaiming finished tasks.
//!
//! Finished tasks keep their workspace (script, log, `task.json`, checked-out
//! code) and registry entry so callers can still read status and logs. Once a
//! task has been terminal for longer than the retention window both are
//! removed. Workspace directories without a registry entry (left behind by
//! crashes or manual copies) are removed once their modification time falls
//! outside the window. Tasks that are not terminal are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::registry::TaskRegistry;
use crate::task::TaskKey;
use crate::workspace::WorkspaceManager;

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// How long finished tasks are retained.
    pub max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),    // 1 hour
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
        }
    }
}

/// Counters of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Registered tasks removed
    pub tasks: u64,
    /// Unregistered workspaces removed
    pub orphans: u64,
    /// Removals that failed
    pub errors: u64,
}

/// Background worker that reclaims expired tasks.
pub struct CleanupWorker {
    registry: Arc<TaskRegistry>,
    workspaces: WorkspaceManager,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

fn cutoff(max_age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(
        registry: Arc<TaskRegistry>,
        workspaces: WorkspaceManager,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            registry,
            workspaces,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            storage_root = %self.workspaces.root().display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> CleanupStats {
        let cutoff = cutoff(self.config.max_age);
        let mut stats = CleanupStats::default();

        self.reclaim_expired_tasks(cutoff, &mut stats).await;
        if let Err(e) = self.reclaim_orphans(cutoff, &mut stats).await {
            error!(error = %e, "Failed to scan storage root for orphaned workspaces");
            stats.errors += 1;
        }

        if stats != CleanupStats::default() {
            info!(
                tasks = stats.tasks,
                orphans = stats.orphans,
                errors = stats.errors,
                "Cleanup cycle completed"
            );
        } else {
            debug!("Cleanup cycle completed, nothing to reclaim");
        }
        stats
    }

    async fn reclaim_expired_tasks(&self, cutoff: DateTime<Utc>, stats: &mut CleanupStats) {
        for handle in self.registry.finished_before(cutoff).await {
            // Workspace first: while the entry exists the task id cannot be resubmitted
            match self.workspaces.remove(&handle.key()).await {
                Ok(()) => {
                    self.registry.remove(&handle.task_id).await;
                    debug!(
                        task_id = %handle.task_id,
                        template_id = %handle.template_id,
                        status = %handle.status,
                        "Reclaimed finished task"
                    );
                    stats.tasks += 1;
                }
                Err(e) => {
                    warn!(task_id = %handle.task_id, error = %e, "Failed to remove task workspace");
                    stats.errors += 1;
                }
            }
        }
    }

    async fn reclaim_orphans(
        &self,
        cutoff: DateTime<Utc>,
        stats: &mut CleanupStats,
    ) -> std::io::Result<()> {
        let mut templates = match tokio::fs::read_dir(self.workspaces.root()).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Storage root does not exist, nothing to clean");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        while let Some(template) = templates.next_entry().await? {
            if !template.file_type().await?.is_dir() {
                continue;
            }
            let template_id = template.file_name().to_string_lossy().into_owned();

            let mut tasks = match tokio::fs::read_dir(template.path()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %template.path().display(), error = %e, "Failed to read template directory");
                    stats.errors += 1;
                    continue;
                }
            };

            while let Ok(Some(task)) = tasks.next_entry().await {
                let task_path = task.path();
                if !task_path.is_dir() {
                    continue;
                }
                let key = TaskKey::new(&template_id, task.file_name().to_string_lossy());

                let registered = match self.registry.lookup(&key.task_id).await {
                    Ok(handle) => handle.template_id == key.template_id,
                    Err(_) => false,
                };
                if registered {
                    continue;
                }

                let modified = match tokio::fs::metadata(&task_path)
                    .await
                    .and_then(|m| m.modified())
                {
                    Ok(t) => DateTime::<Utc>::from(t),
                    Err(e) => {
                        debug!(path = %task_path.display(), error = %e, "Failed to get modification time");
                        stats.errors += 1;
                        continue;
                    }
                };
                if modified > cutoff {
                    continue;
                }

                match self.workspaces.remove(&key).await {
                    Ok(()) => {
                        debug!(
                            path = %task_path.display(),
                            age_hours = (Utc::now() - modified).num_hours(),
                            "Removed orphaned workspace"
                        );
                        stats.orphans += 1;
                    }
                    Err(e) => {
                        warn!(path = %task_path.display(), error = %e, "Failed to remove orphaned workspace");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
