// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task workspace directories.
//!
//! Layout: `{storage_root}/{template_id}/{task_id}/` containing
//! - `run.sh` - the generated script
//! - `runner.log` - combined stdout/stderr of the execution
//! - `task.json` - last snapshot of the task handle
//! - anything the execution itself writes (checked-out code, state files)

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::TaskKey;

/// File name of the generated script inside a workspace.
pub const SCRIPT_FILE_NAME: &str = "run.sh";

/// File name of the task log inside a workspace.
pub const LOG_FILE_NAME: &str = "runner.log";

/// Permission bits of a task workspace directory.
#[cfg(unix)]
pub const WORKSPACE_MODE: u32 = 0o755;

/// File name of the persisted task handle inside a workspace.
pub const SNAPSHOT_FILE_NAME: &str = "task.json";

/// Creates and resolves task workspaces under a storage root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic workspace path for a key. Does not touch disk.
    pub fn path_for(&self, key: &TaskKey) -> PathBuf {
        self.root.join(&key.template_id).join(&key.task_id)
    }

    /// Host path of the generated script.
    pub fn script_path(&self, key: &TaskKey) -> PathBuf {
        self.path_for(key).join(SCRIPT_FILE_NAME)
    }

    /// Host path of the task log.
    pub fn log_path(&self, key: &TaskKey) -> PathBuf {
        self.path_for(key).join(LOG_FILE_NAME)
    }

    /// Host path of the handle snapshot.
    pub fn snapshot_path(&self, key: &TaskKey) -> PathBuf {
        self.path_for(key).join(SNAPSHOT_FILE_NAME)
    }

    /// Create the workspace (and any missing parents) and return its path.
    ///
    /// The workspace directory gets mode [`WORKSPACE_MODE`].
    ///
    /// Idempotent: an existing directory is not an error.
    pub async fn ensure_workspace(&self, key: &TaskKey) -> Result<PathBuf> {
        let path = self.path_for(key);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            Error::Storage(format!(
                "failed to create workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        // Only the runner may replace the generated script; others read and traverse
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(WORKSPACE_MODE))
                .await
                .map_err(|e| {
                    Error::Storage(format!(
                        "failed to set permissions on {}: {}",
                        path.display(),
                        e
                    ))
                })?;
        }

        debug!(workspace = %path.display(), "Workspace ready");
        Ok(path)
    }

    /// Whether the workspace already holds a generated script from an earlier submission.
    pub async fn is_claimed(&self, key: &TaskKey) -> bool {
        tokio::fs::try_exists(self.script_path(key))
            .await
            .unwrap_or(false)
    }

    /// Remove a workspace and everything in it. Missing directories are ignored.
    pub async fn remove(&self, key: &TaskKey) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        // Drop the template directory once its last task is gone
        if let Some(parent) = path.parent()
            && parent != self.root
        {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
