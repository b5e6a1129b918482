// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout and cancellation supervision of a launched unit.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::traits::{LaunchHandle, Launcher, RunnerError};
use crate::task::TaskStatus;

/// How long to wait for a killed unit to be reaped.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Terminal outcome of a supervised unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Terminal status
    pub status: TaskStatus,
    /// Exit code, when the unit exited on its own
    pub exit_code: Option<i32>,
    /// Failure description
    pub error: Option<String>,
}

enum Trigger {
    Exited(Result<i32, RunnerError>),
    Canceled,
    TimedOut,
}

/// Wait for `handle` to finish, killing it on timeout or cancellation.
///
/// The timeout is a hard limit: a unit still running when it elapses is
/// killed and reported `timed-out`, whatever it would have exited with.
/// Blocks only the calling task.
pub async fn supervise(
    launcher: &dyn Launcher,
    handle: &LaunchHandle,
    timeout: Duration,
    cancel: CancellationToken,
) -> Outcome {
    let mut wait = launcher.wait(handle);

    let trigger = tokio::select! {
        biased;
        result = &mut wait => Trigger::Exited(result),
        _ = cancel.cancelled() => Trigger::Canceled,
        _ = tokio::time::sleep(timeout) => Trigger::TimedOut,
    };

    let outcome = match trigger {
        Trigger::Exited(Ok(0)) => {
            info!(task_id = %handle.task_id, handle_id = %handle.handle_id, "Execution succeeded");
            Outcome {
                status: TaskStatus::Succeeded,
                exit_code: Some(0),
                error: None,
            }
        }
        Trigger::Exited(Ok(code)) => {
            warn!(task_id = %handle.task_id, exit_code = code, "Execution failed");
            Outcome {
                status: TaskStatus::Failed,
                exit_code: Some(code),
                error: Some(format!("exited with code {}", code)),
            }
        }
        Trigger::Exited(Err(e)) => {
            error!(task_id = %handle.task_id, error = %e, "Lost track of execution unit");
            Outcome {
                status: TaskStatus::Failed,
                exit_code: None,
                error: Some(e.to_string()),
            }
        }
        Trigger::Canceled => {
            warn!(task_id = %handle.task_id, "Execution cancelled, killing unit");
            kill_and_reap(launcher, handle, wait).await;
            Outcome {
                status: TaskStatus::Canceled,
                exit_code: None,
                error: Some("canceled".to_string()),
            }
        }
        Trigger::TimedOut => {
            warn!(
                task_id = %handle.task_id,
                timeout_secs = timeout.as_secs(),
                "Execution timed out, killing unit"
            );
            kill_and_reap(launcher, handle, wait).await;
            Outcome {
                status: TaskStatus::TimedOut,
                exit_code: None,
                error: Some(format!("timed out after {}s", timeout.as_secs())),
            }
        }
    };

    if let Err(e) = launcher.release(handle).await {
        warn!(task_id = %handle.task_id, error = %e, "Failed to release execution unit");
    }
    outcome
}

async fn kill_and_reap<F>(launcher: &dyn Launcher, handle: &LaunchHandle, wait: F)
where
    F: std::future::Future<Output = Result<i32, RunnerError>>,
{
    if let Err(e) = launcher.cancel(handle).await {
        error!(task_id = %handle.task_id, error = %e, "Failed to kill execution unit");
    }
    if tokio::time::timeout(KILL_GRACE, wait).await.is_err() {
        warn!(
            task_id = %handle.task_id,
            grace_secs = KILL_GRACE.as_secs(),
            "Execution unit not reaped within grace period"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::runner::MockLauncher;
    use crate::task::TaskRequest;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;

    async fn launch(launcher: &MockLauncher, temp_dir: &TempDir) -> LaunchHandle {
        let workspaces = WorkspaceManager::new(temp_dir.path());
        let spec = CommandBuilder::new(workspaces.clone(), "img", Duration::from_secs(60), None)
            .build(&TaskRequest::new("tpl", "task"))
            .unwrap();
        workspaces.ensure_workspace(&spec.key).await.unwrap();
        launcher.launch(&spec).await.unwrap()
    }

    #[tokio::test]
    async fn test_success() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let handle = launch(&launcher, &temp_dir).await;

        let outcome = supervise(
            &launcher,
            &handle,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.status, TaskStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = MockLauncher::exiting_with(2);
        let handle = launch(&launcher, &temp_dir).await;

        let outcome = supervise(
            &launcher,
            &handle,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_timeout_wins_over_eventual_success() {
        let temp_dir = TempDir::new().unwrap();
        let mut launcher = MockLauncher::new();
        launcher.execution_delay = Duration::from_secs(10);
        let handle = launch(&launcher, &temp_dir).await;

        let outcome = supervise(
            &launcher,
            &handle,
            Duration::from_millis(100),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.status, TaskStatus::TimedOut);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn test_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = MockLauncher::never_completing();
        let handle = launch(&launcher, &temp_dir).await;
        let token = CancellationToken::new();
        token.cancel();

        let outcome = supervise(&launcher, &handle, Duration::from_secs(5), token).await;
        assert_eq!(outcome.status, TaskStatus::Canceled);
    }
}
