// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.
//!
//! Defines the abstract interface for execution backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::command::ExecutionSpec;

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The execution unit could not be started (image pull failure, runtime unavailable).
    #[error("Start failed: {0}")]
    StartFailed(String),

    /// The launcher does not know this handle.
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    /// The container runtime reported an error.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Handle for a launched execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    /// Container ID for docker, `proc-<pid>` for native processes
    pub handle_id: String,
    /// Task identity
    pub task_id: String,
    /// When the unit was started
    pub started_at: DateTime<Utc>,
    /// PID of the spawned process, when the launcher owns one
    pub pid: Option<u32>,
}

/// Trait for execution backends.
///
/// Launchers only start, wait for and kill execution units. They do not track
/// task status; that is the registry's job, driven by [`supervise`](super::supervise).
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher type identifier (e.g., "docker", "process")
    fn launcher_type(&self) -> &'static str;

    /// Fixed directory the workspace is mounted at inside the execution unit.
    ///
    /// `None` when the unit runs directly in the host workspace.
    fn mount_dir(&self) -> Option<&Path>;

    /// Start the execution unit without waiting for it.
    async fn launch(&self, spec: &ExecutionSpec) -> Result<LaunchHandle>;

    /// Block until the unit exits and return its exit code.
    async fn wait(&self, handle: &LaunchHandle) -> Result<i32>;

    /// Forcibly terminate the unit. Cancelling a finished unit is a no-op.
    async fn cancel(&self, handle: &LaunchHandle) -> Result<()>;

    /// Free runtime resources held for a finished unit.
    async fn release(&self, handle: &LaunchHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }
}
