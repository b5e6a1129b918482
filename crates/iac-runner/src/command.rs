// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Translation of task requests into execution specifications.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::script::shell_quote;
use crate::task::{TaskKey, TaskRequest, validate_identifier};
use crate::workspace::{LOG_FILE_NAME, SCRIPT_FILE_NAME, WorkspaceManager};

/// Variables every execution gets unless the caller overrides them.
pub const BASELINE_ENV: &[(&str, &str)] = &[
    ("TF_IN_AUTOMATION", "true"),
    ("TF_INPUT", "0"),
    ("ANSIBLE_HOST_KEY_CHECKING", "False"),
    ("ANSIBLE_FORCE_COLOR", "0"),
    ("ANSIBLE_TF_DIR", "."),
];

/// Everything a launcher needs to start one execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSpec {
    /// Workspace identity
    pub key: TaskKey,
    /// Resolved container image
    pub image: String,
    /// Flattened environment (baseline + caller overrides)
    pub env: BTreeMap<String, String>,
    /// Host path of the workspace
    pub workspace: PathBuf,
    /// Path the execution unit sees the workspace at
    pub exec_workdir: PathBuf,
    /// Host path of the generated script
    pub script_path: PathBuf,
    /// Host path of the log file
    pub log_path: PathBuf,
    /// Command run inside the execution unit
    pub command: Vec<String>,
    /// Hard execution limit
    pub timeout: Duration,
}

/// Builds [`ExecutionSpec`]s from task requests.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    workspaces: WorkspaceManager,
    default_image: String,
    default_timeout: Duration,
    /// `None` means the execution unit sees the host workspace directly.
    mount_dir: Option<PathBuf>,
}

impl CommandBuilder {
    /// Create a builder.
    ///
    /// `mount_dir` is the fixed in-container directory the workspace is
    /// bind-mounted at, or `None` for launchers that run on the host.
    pub fn new(
        workspaces: WorkspaceManager,
        default_image: impl Into<String>,
        default_timeout: Duration,
        mount_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            workspaces,
            default_image: default_image.into(),
            default_timeout,
            mount_dir,
        }
    }

    /// Merge the baseline with caller overrides. Caller keys always win.
    pub fn merge_env(request: &TaskRequest) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = BASELINE_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("IAC_TEMPLATE_ID".to_string(), request.template_uuid.clone());
        env.insert("IAC_TASK_ID".to_string(), request.task_id.clone());
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// The shell command: run the script, appending stdout+stderr to the log.
    pub fn exec_command(workdir: &Path) -> Vec<String> {
        let script = workdir.join(SCRIPT_FILE_NAME);
        let log = workdir.join(LOG_FILE_NAME);
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "sh {} >> {} 2>&1",
                shell_quote(&script.to_string_lossy()),
                shell_quote(&log.to_string_lossy())
            ),
        ]
    }

    /// Build the execution spec for a request.
    pub fn build(&self, request: &TaskRequest) -> Result<ExecutionSpec> {
        validate_identifier("template_uuid", &request.template_uuid)?;
        validate_identifier("task_id", &request.task_id)?;

        let key = request.key();
        let image = request
            .docker_image
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_image)
            .to_string();
        if image.is_empty() {
            return Err(Error::Validation(
                "no docker_image given and no default image configured".to_string(),
            ));
        }

        let workspace = self.workspaces.path_for(&key);
        let exec_workdir = self
            .mount_dir
            .clone()
            .unwrap_or_else(|| workspace.clone());

        let timeout = match request.timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.default_timeout,
        };

        Ok(ExecutionSpec {
            image,
            env: Self::merge_env(request),
            script_path: self.workspaces.script_path(&key),
            log_path: self.workspaces.log_path(&key),
            command: Self::exec_command(&exec_workdir),
            workspace,
            exec_workdir,
            timeout,
            key,
        })
    }
}
