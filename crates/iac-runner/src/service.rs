// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task service.
//!
//! Orchestrates the components for each operation callers can perform:
//!
//! - **submit**: validate, reserve the task identity, prepare the workspace and
//!   script, launch, then hand the unit to a background supervisor
//! - **status**: correlate a caller's view of a run with the registry record
//! - **logs**: incremental log reads that advance the delivered offset
//! - **cancel**: idempotent early termination

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{CommandBuilder, ExecutionSpec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::log_store::LogStore;
use crate::registry::TaskRegistry;
use crate::runner::{LaunchHandle, Launcher, Outcome, supervise};
use crate::script::{ScriptGenerator, ScriptOptions};
use crate::task::{TaskHandle, TaskRequest, TaskStatus};
use crate::workspace::WorkspaceManager;

/// One batch of log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    /// Task identity
    pub task_id: String,
    /// Offset the batch starts at
    pub offset: usize,
    /// Offset to ask for next. A partial last line is not counted, so it is
    /// returned again once complete.
    pub next_offset: usize,
    /// Lines currently in the log
    pub total_lines: usize,
    /// Task status at the time of the read
    pub status: TaskStatus,
    /// The lines, without terminators
    pub lines: Vec<String>,
}

/// Shared state behind every task operation.
pub struct TaskService {
    registry: Arc<TaskRegistry>,
    workspaces: WorkspaceManager,
    logs: LogStore,
    scripts: ScriptGenerator,
    commands: CommandBuilder,
    launcher: Arc<dyn Launcher>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    max_log_lines: usize,
}

impl TaskService {
    /// Wire up the components from configuration.
    pub fn new(config: &Config, launcher: Arc<dyn Launcher>) -> Self {
        let workspaces = WorkspaceManager::new(&config.storage_path);
        let commands = CommandBuilder::new(
            workspaces.clone(),
            &config.default_image,
            config.default_timeout,
            launcher.mount_dir().map(|p| p.to_path_buf()),
        );
        let scripts = ScriptGenerator::new(ScriptOptions {
            plugin_dir: config.plugin_dir.clone(),
            ansible_inventory: config.ansible_inventory.clone(),
        });

        Self {
            registry: Arc::new(TaskRegistry::new(workspaces.clone())),
            logs: LogStore::new(workspaces.clone()),
            workspaces,
            scripts,
            commands,
            launcher,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            max_log_lines: config.max_log_lines,
        }
    }

    /// The task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The workspace layout.
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// The execution backend.
    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }

    /// Reload tasks persisted by a previous run of the runner.
    pub async fn recover(&self) -> Result<usize> {
        self.registry.recover(self.launcher.as_ref()).await
    }

    /// Submit a task for execution.
    ///
    /// Returns once the execution unit has been started; the task keeps running
    /// in the background under a supervisor enforcing its timeout.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskHandle> {
        let mode = request.validate()?;
        let spec = self.commands.build(&request)?;
        let key = spec.key.clone();

        // Registered under the same lock, so `cancel` always finds the token
        let token = CancellationToken::new();
        {
            let mut cancellations = self.cancellations.lock().await;
            self.registry
                .register(TaskHandle::new(&key, spec.workspace.clone()))
                .await?;
            cancellations.insert(key.task_id.clone(), token.clone());
        }

        if let Err(e) = self.prepare(&request, &spec).await {
            self.cancellations.lock().await.remove(&key.task_id);
            self.registry.remove(&key.task_id).await;
            return Err(e);
        }

        if token.is_cancelled() {
            info!(task_id = %key.task_id, "Task canceled before launch");
            self.cancellations.lock().await.remove(&key.task_id);
            return self
                .registry
                .finish(
                    &key.task_id,
                    Outcome {
                        status: TaskStatus::Canceled,
                        exit_code: None,
                        error: Some("canceled".to_string()),
                    },
                )
                .await;
        }

        info!(
            task_id = %key.task_id,
            template_id = %key.template_id,
            mode = %mode,
            image = %spec.image,
            launcher = self.launcher.launcher_type(),
            timeout_secs = spec.timeout.as_secs(),
            "Launching task"
        );

        let launch_handle = match self.launcher.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(task_id = %key.task_id, error = %e, "Failed to launch task");
                self.cancellations.lock().await.remove(&key.task_id);
                self.registry
                    .fail(&key.task_id, format!("launch failed: {}", e))
                    .await?;
                return Err(Error::Launch(e.to_string()));
            }
        };

        let handle = self
            .registry
            .mark_running(&key.task_id, &launch_handle.handle_id)
            .await?;
        self.spawn_supervisor(launch_handle, spec, token);
        Ok(handle)
    }

    /// Claim and fill the workspace. Nothing is launched yet.
    async fn prepare(&self, request: &TaskRequest, spec: &ExecutionSpec) -> Result<()> {
        if self.workspaces.is_claimed(&spec.key).await {
            return Err(Error::TaskExists(spec.key.to_string()));
        }
        self.workspaces.ensure_workspace(&spec.key).await?;
        self.scripts.render(request, &spec.script_path).await
    }

    fn spawn_supervisor(
        &self,
        launch_handle: LaunchHandle,
        spec: ExecutionSpec,
        token: CancellationToken,
    ) {
        let registry = self.registry.clone();
        let launcher = self.launcher.clone();
        let cancellations = self.cancellations.clone();

        tokio::spawn(async move {
            let task_id = spec.key.task_id.clone();
            let outcome = supervise(launcher.as_ref(), &launch_handle, spec.timeout, token).await;
            if let Err(e) = registry.finish(&task_id, outcome).await {
                warn!(task_id = %task_id, error = %e, "Task vanished before its outcome was recorded");
            }
            cancellations.lock().await.remove(&task_id);
        });
    }

    /// Current record of a task.
    ///
    /// `template_id` and, when given, `container_id` must match the record;
    /// a mismatch means the caller is asking about a different run and is
    /// reported as not found. A given `offset` is recorded as delivered.
    pub async fn status(
        &self,
        template_id: &str,
        task_id: &str,
        container_id: Option<&str>,
        offset: Option<usize>,
    ) -> Result<TaskHandle> {
        let handle = self.registry.lookup(task_id).await?;
        if handle.template_id != template_id {
            return Err(Error::TaskNotFound(format!("{}/{}", template_id, task_id)));
        }
        if let Some(container_id) = container_id.filter(|c| !c.is_empty())
            && handle.container_id.as_deref() != Some(container_id)
        {
            return Err(Error::TaskNotFound(format!(
                "{} (container {})",
                task_id, container_id
            )));
        }

        match offset {
            Some(offset) => {
                let log_offset = self.registry.advance_offset(task_id, offset).await?;
                Ok(TaskHandle {
                    log_offset,
                    ..handle
                })
            }
            None => Ok(handle),
        }
    }

    /// Read new log lines.
    ///
    /// Without an explicit `offset`, reading continues from the offset last
    /// delivered for this task. `max_lines` is capped by configuration.
    pub async fn logs(
        &self,
        task_id: &str,
        offset: Option<usize>,
        max_lines: Option<usize>,
    ) -> Result<LogChunk> {
        let handle = self.registry.lookup(task_id).await?;
        let key = handle.key();
        let start = offset.unwrap_or(handle.log_offset);
        let max_lines = max_lines
            .unwrap_or(self.max_log_lines)
            .min(self.max_log_lines);

        let slice = self.logs.read_since(&key, start, max_lines).await?;
        let next_offset = slice.next_offset(start);
        self.registry.advance_offset(task_id, next_offset).await?;
        debug!(
            task_id = %task_id,
            offset = start,
            returned = slice.lines.len(),
            partial = slice.partial,
            "Served log lines"
        );

        Ok(LogChunk {
            task_id: task_id.to_string(),
            offset: start,
            next_offset,
            total_lines: slice.total_lines.max(next_offset),
            status: handle.status,
            lines: slice.lines,
        })
    }

    /// Request early termination of a task.
    ///
    /// Idempotent: cancelling a finished or already cancelled task returns its
    /// current record. The status turns `canceled` once the unit is gone.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskHandle> {
        let handle = self.registry.lookup(task_id).await?;
        if handle.status.is_terminal() {
            debug!(task_id = %task_id, status = %handle.status, "Cancel on finished task ignored");
            return Ok(handle);
        }

        if let Some(token) = self.cancellations.lock().await.get(task_id) {
            info!(task_id = %task_id, "Cancelling task");
            token.cancel();
        }
        Ok(handle)
    }

    /// Block until a task reaches a terminal status.
    pub async fn wait_terminal(
        &self,
        task_id: &str,
        poll_interval: std::time::Duration,
    ) -> Result<TaskHandle> {
        loop {
            let handle = self.registry.lookup(task_id).await?;
            if handle.status.is_terminal() {
                return Ok(handle);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Number of tasks with a live supervisor.
    pub async fn active_count(&self) -> usize {
        self.cancellations.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockLauncher;
    use crate::task::TaskKey;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn config(temp_dir: &TempDir) -> Config {
        Config {
            storage_path: temp_dir.path().to_path_buf(),
            max_log_lines: 5,
            ..Default::default()
        }
    }

    fn service(temp_dir: &TempDir, launcher: MockLauncher) -> TaskService {
        TaskService::new(&config(temp_dir), Arc::new(launcher))
    }

    async fn wait(service: &TaskService, task_id: &str) -> TaskHandle {
        tokio::time::timeout(
            Duration::from_secs(5),
            service.wait_terminal(task_id, Duration::from_millis(10)),
        )
        .await
        .expect("task should finish")
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let service = TaskService::new(&config(&temp_dir), launcher.clone());

        let handle = service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();
        assert_eq!(handle.status, TaskStatus::Running);
        assert!(handle.container_id.is_some());
        assert!(temp_dir.path().join("tpl/task-1/run.sh").exists());

        let done = wait(&service, "task-1").await;
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.exit_code, Some(0));

        let launched = launcher.launched().await;
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].key, TaskKey::new("tpl", "task-1"));
        assert_eq!(launched[0].image, crate::config::DEFAULT_IMAGE);
    }

    #[tokio::test]
    async fn test_cancel_before_unit_starts_takes_effect() {
        let temp_dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let mut launcher = MockLauncher::never_completing();
        launcher.launch_gate = Some(gate.clone());
        let service = Arc::new(service(&temp_dir, launcher));

        let submit = tokio::spawn({
            let service = service.clone();
            async move { service.submit(TaskRequest::new("tpl", "task-1")).await }
        });
        while !service.registry().contains("task-1").await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let pending = service.cancel("task-1").await.unwrap();
        assert_eq!(pending.status, TaskStatus::NotStarted);
        gate.notify_one();
        submit.await.unwrap().unwrap();

        let done = wait(&service, "task-1").await;
        assert_eq!(done.status, TaskStatus::Canceled);
        assert_eq!(service.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_mode_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::new());
        let mut request = TaskRequest::new("tpl", "task-1");
        request.mode = "deploy".to_string();

        let result = service.submit(request).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(!temp_dir.path().join("tpl").exists());
        assert!(!service.registry().contains("task-1").await);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::never_completing());

        service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();
        let result = service.submit(TaskRequest::new("tpl", "task-1")).await;
        assert!(matches!(result, Err(Error::TaskExists(_))));
    }

    #[tokio::test]
    async fn test_claimed_workspace_is_not_reused() {
        let temp_dir = TempDir::new().unwrap();
        let workspace = temp_dir.path().join("tpl").join("task-1");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("run.sh"), "echo previous run\n").unwrap();
        let service = service(&temp_dir, MockLauncher::new());

        let result = service.submit(TaskRequest::new("tpl", "task-1")).await;
        assert!(matches!(result, Err(Error::TaskExists(_))));
        // The reservation is released and the old script untouched
        assert!(!service.registry().contains("task-1").await);
        assert_eq!(
            std::fs::read_to_string(workspace.join("run.sh")).unwrap(),
            "echo previous run\n"
        );
    }

    #[tokio::test]
    async fn test_launch_failure_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::failing_launch("image not found"));

        let result = service.submit(TaskRequest::new("tpl", "task-1")).await;
        assert!(matches!(result, Err(Error::Launch(_))));

        let handle = service.registry().lookup("task-1").await.unwrap();
        assert_eq!(handle.status, TaskStatus::Failed);
        assert!(handle.error.unwrap().contains("image not found"));
        assert_eq!(service.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::never_completing());
        service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();

        service.cancel("task-1").await.unwrap();
        let done = wait(&service, "task-1").await;
        assert_eq!(done.status, TaskStatus::Canceled);

        let again = service.cancel("task-1").await.unwrap();
        assert_eq!(again.status, TaskStatus::Canceled);
        assert!(matches!(
            service.cancel("missing").await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_logs_advance_offset() {
        let temp_dir = TempDir::new().unwrap();
        let mut launcher = MockLauncher::new();
        launcher.log_lines = (1..=8).map(|i| format!("line {}", i)).collect();
        let service = service(&temp_dir, launcher);
        service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();

        let first = service.logs("task-1", None, None).await.unwrap();
        assert_eq!(first.lines.len(), 5);
        assert_eq!(first.offset, 0);
        assert_eq!(first.next_offset, 5);
        assert_eq!(first.total_lines, 8);

        let second = service.logs("task-1", None, Some(100)).await.unwrap();
        assert_eq!(second.offset, 5);
        assert_eq!(second.lines, vec!["line 6", "line 7", "line 8"]);

        // Re-reading an earlier range never moves the delivered offset back
        let replay = service.logs("task-1", Some(0), Some(2)).await.unwrap();
        assert_eq!(replay.lines, vec!["line 1", "line 2"]);
        assert_eq!(
            service.registry().lookup("task-1").await.unwrap().log_offset,
            8
        );
    }

    #[tokio::test]
    async fn test_logs_redeliver_partial_line() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::never_completing());
        let handle = service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();
        let log_path = handle.workspace.join("runner.log");
        std::fs::write(&log_path, "a\nApplying: 50%").unwrap();

        let first = service.logs("task-1", None, None).await.unwrap();
        assert_eq!(first.lines, vec!["a", "Applying: 50%"]);
        assert_eq!(first.next_offset, 1);
        assert_eq!(first.total_lines, 2);

        std::fs::write(&log_path, "a\nApplying: 50% ... done\nb\n").unwrap();
        let second = service.logs("task-1", None, None).await.unwrap();
        assert_eq!(second.offset, 1);
        assert_eq!(second.lines, vec!["Applying: 50% ... done", "b"]);
        assert_eq!(second.next_offset, 3);
        assert_eq!(
            service.registry().lookup("task-1").await.unwrap().log_offset,
            3
        );
    }

    #[tokio::test]
    async fn test_status_correlation() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(&temp_dir, MockLauncher::new());
        let handle = service
            .submit(TaskRequest::new("tpl", "task-1"))
            .await
            .unwrap();
        let container_id = handle.container_id.unwrap();

        let status = service
            .status("tpl", "task-1", Some(&container_id), Some(3))
            .await
            .unwrap();
        assert_eq!(status.log_offset, 3);

        assert!(matches!(
            service.status("other", "task-1", None, None).await,
            Err(Error::TaskNotFound(_))
        ));
        assert!(matches!(
            service
                .status("tpl", "task-1", Some("another-container"), None)
                .await,
            Err(Error::TaskNotFound(_))
        ));
    }
}
