// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process launcher.
//!
//! Runs the generated command directly on the host, in the task workspace and
//! in its own process group so cancellation takes down every descendant.
//! Intended for development and tests; provides no isolation.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::command::ExecutionSpec;

#[derive(Debug)]
struct ProcessEntry {
    child: Option<Child>,
    pid: u32,
    exit_code: Option<i32>,
}

/// Launcher that runs tasks as host processes.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    processes: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessLauncher {
    /// Create a new process launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of processes not yet released.
    pub async fn tracked(&self) -> usize {
        self.processes.lock().await.len()
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    fn mount_dir(&self) -> Option<&Path> {
        None
    }

    async fn launch(&self, spec: &ExecutionSpec) -> Result<LaunchHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| RunnerError::StartFailed("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.workspace)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("failed to spawn {}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| RunnerError::StartFailed("process exited before start".to_string()))?;

        let handle_id = format!("proc-{}", pid);
        self.processes.lock().await.insert(
            handle_id.clone(),
            ProcessEntry {
                child: Some(child),
                pid,
                exit_code: None,
            },
        );

        info!(
            task_id = %spec.key.task_id,
            handle_id = %handle_id,
            workspace = %spec.workspace.display(),
            "Launched process"
        );

        Ok(LaunchHandle {
            handle_id,
            task_id: spec.key.task_id.clone(),
            started_at: chrono::Utc::now(),
            pid: Some(pid),
        })
    }

    async fn wait(&self, handle: &LaunchHandle) -> Result<i32> {
        let child = {
            let mut processes = self.processes.lock().await;
            let entry = processes
                .get_mut(&handle.handle_id)
                .ok_or_else(|| RunnerError::UnknownHandle(handle.handle_id.clone()))?;
            if let Some(code) = entry.exit_code {
                return Ok(code);
            }
            entry.child.take()
        };

        let Some(mut child) = child else {
            // Another caller owns the child; poll for its result
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let processes = self.processes.lock().await;
                match processes.get(&handle.handle_id) {
                    Some(ProcessEntry {
                        exit_code: Some(code),
                        ..
                    }) => return Ok(*code),
                    Some(_) => continue,
                    None => return Err(RunnerError::UnknownHandle(handle.handle_id.clone())),
                }
            }
        };

        let status = child.wait().await?;
        let code = exit_code_of(status);
        if let Some(entry) = self.processes.lock().await.get_mut(&handle.handle_id) {
            entry.exit_code = Some(code);
        }
        debug!(handle_id = %handle.handle_id, exit_code = code, "Process exited");
        Ok(code)
    }

    async fn cancel(&self, handle: &LaunchHandle) -> Result<()> {
        let pid = {
            let processes = self.processes.lock().await;
            match processes.get(&handle.handle_id) {
                Some(entry) if entry.exit_code.is_none() => entry.pid,
                _ => return Ok(()),
            }
        };

        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                warn!(handle_id = %handle.handle_id, pid = pid, "Killed process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RunnerError::Runtime(format!(
                "failed to kill process group {}: {}",
                pid, e
            ))),
        }
    }

    async fn release(&self, handle: &LaunchHandle) -> Result<()> {
        let Some(entry) = self.processes.lock().await.remove(&handle.handle_id) else {
            return Ok(());
        };
        if entry.exit_code.is_none() {
            // Not reaped within the grace period; the runtime reaps it on exit
            warn!(handle_id = %handle.handle_id, pid = entry.pid, "Releasing unreaped process");
            let _ = killpg(Pid::from_raw(entry.pid as i32), Signal::SIGKILL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::task::TaskRequest;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;

    async fn spec_with_script(temp_dir: &TempDir, script: &str) -> ExecutionSpec {
        let workspaces = WorkspaceManager::new(temp_dir.path());
        let builder = CommandBuilder::new(
            workspaces.clone(),
            "unused",
            Duration::from_secs(60),
            None,
        );
        let spec = builder.build(&TaskRequest::new("tpl", "task")).unwrap();
        workspaces.ensure_workspace(&spec.key).await.unwrap();
        std::fs::write(&spec.script_path, script).unwrap();
        spec
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_with_script(&temp_dir, "echo hello\nexit 3\n").await;
        let launcher = ProcessLauncher::new();

        let handle = launcher.launch(&spec).await.unwrap();
        assert_eq!(launcher.wait(&handle).await.unwrap(), 3);
        // Waiting again returns the recorded code
        assert_eq!(launcher.wait(&handle).await.unwrap(), 3);

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert_eq!(log, "hello\n");
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_with_script(&temp_dir, "echo \"$IAC_TASK_ID $TF_INPUT\"\n").await;
        let launcher = ProcessLauncher::new();

        let handle = launcher.launch(&spec).await.unwrap();
        assert_eq!(launcher.wait(&handle).await.unwrap(), 0);
        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert_eq!(log, "task 0\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group_and_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_with_script(&temp_dir, "sleep 30\n").await;
        let launcher = ProcessLauncher::new();

        let handle = launcher.launch(&spec).await.unwrap();
        launcher.cancel(&handle).await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), launcher.wait(&handle))
            .await
            .expect("process should die promptly")
            .unwrap();
        assert_eq!(code, 128 + 9);

        launcher.cancel(&handle).await.unwrap();
        launcher.release(&handle).await.unwrap();
        assert_eq!(launcher.tracked().await, 0);
        // Unknown handles are a no-op too
        launcher.cancel(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_forgets_unreaped_process() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_with_script(&temp_dir, "sleep 30\n").await;
        let launcher = ProcessLauncher::new();

        let handle = launcher.launch(&spec).await.unwrap();
        assert_eq!(launcher.tracked().await, 1);

        launcher.release(&handle).await.unwrap();
        assert_eq!(launcher.tracked().await, 0);
        assert!(matches!(
            launcher.wait(&handle).await,
            Err(RunnerError::UnknownHandle(_))
        ));
        launcher.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_start_failed() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = spec_with_script(&temp_dir, "true\n").await;
        spec.command = vec!["/nonexistent/binary".to_string()];

        let result = ProcessLauncher::new().launch(&spec).await;
        assert!(matches!(result, Err(RunnerError::StartFailed(_))));
    }
}
