// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker container launcher.
//!
//! Drives the docker CLI. Each task gets one detached container with its
//! workspace bind-mounted at a fixed directory. Environment values are handed
//! to the CLI through its own process environment (`-e KEY` without a value),
//! so they never show up in the process list.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::traits::*;
use crate::command::ExecutionSpec;

/// Docker launcher configuration
#[derive(Debug, Clone)]
pub struct DockerLauncherConfig {
    /// Docker CLI binary
    pub docker_bin: String,
    /// In-container mount point of the workspace
    pub mount_dir: PathBuf,
    /// Extra arguments for `docker run` (network, resource limits, ...)
    pub extra_run_args: Vec<String>,
}

impl Default for DockerLauncherConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            mount_dir: PathBuf::from(crate::config::DEFAULT_CONTAINER_WORKDIR),
            extra_run_args: Vec::new(),
        }
    }
}

/// Launcher that runs each task in a docker container.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    config: DockerLauncherConfig,
}

/// Errors from `docker kill` that mean there is nothing left to kill.
fn is_already_gone(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("is not running")
}

impl DockerLauncher {
    /// Create a new docker launcher
    pub fn new(config: DockerLauncherConfig) -> Self {
        Self { config }
    }

    /// Container name for a spec.
    ///
    /// Validated identifiers only use `[A-Za-z0-9_.-]`, which docker accepts
    /// in names as-is.
    pub fn container_name(spec: &ExecutionSpec) -> String {
        format!("iac-{}-{}", spec.key.template_id, spec.key.task_id)
    }

    /// Arguments for `docker run`, without the binary itself.
    pub fn run_args(&self, spec: &ExecutionSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(spec),
            "-v".to_string(),
            format!(
                "{}:{}",
                spec.workspace.display(),
                self.config.mount_dir.display()
            ),
            "-w".to_string(),
            self.config.mount_dir.display().to_string(),
        ];
        for key in spec.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.extend(self.config.extra_run_args.iter().cloned());
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(RunnerError::Io)
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    fn launcher_type(&self) -> &'static str {
        "docker"
    }

    fn mount_dir(&self) -> Option<&Path> {
        Some(&self.config.mount_dir)
    }

    async fn launch(&self, spec: &ExecutionSpec) -> Result<LaunchHandle> {
        let args = self.run_args(spec);
        debug!(
            task_id = %spec.key.task_id,
            image = %spec.image,
            name = %Self::container_name(spec),
            "Launching container"
        );

        // May block while the image is pulled
        let output = Command::new(&self.config.docker_bin)
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                RunnerError::StartFailed(format!(
                    "failed to run {}: {}",
                    self.config.docker_bin, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                task_id = %spec.key.task_id,
                image = %spec.image,
                stderr = %stderr,
                "Container failed to start"
            );
            // A created-but-not-started container would block a resubmission
            let name = Self::container_name(spec);
            let _ = self.docker(&["rm", "-f", &name]).await;
            return Err(RunnerError::StartFailed(if stderr.is_empty() {
                format!("docker run exited with status: {}", output.status)
            } else {
                stderr
            }));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(RunnerError::StartFailed(
                "docker run returned no container id".to_string(),
            ));
        }

        info!(
            task_id = %spec.key.task_id,
            container_id = %container_id,
            image = %spec.image,
            "Launched container (detached)"
        );

        Ok(LaunchHandle {
            handle_id: container_id,
            task_id: spec.key.task_id.clone(),
            started_at: chrono::Utc::now(),
            pid: None,
        })
    }

    async fn wait(&self, handle: &LaunchHandle) -> Result<i32> {
        let output = self.docker(&["wait", &handle.handle_id]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RunnerError::Runtime(format!("docker wait failed: {}", stderr)));
        }
        stdout.trim().parse::<i32>().map_err(|_| {
            RunnerError::Runtime(format!("unexpected docker wait output: {}", stdout.trim()))
        })
    }

    async fn cancel(&self, handle: &LaunchHandle) -> Result<()> {
        let output = self.docker(&["kill", &handle.handle_id]).await?;
        if output.status.success() {
            warn!(container_id = %handle.handle_id, "Killed container");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_gone(&stderr) {
            return Ok(());
        }
        Err(RunnerError::Runtime(format!(
            "docker kill failed: {}",
            stderr.trim()
        )))
    }

    async fn release(&self, handle: &LaunchHandle) -> Result<()> {
        let output = self.docker(&["rm", "-f", &handle.handle_id]).await?;
        if !output.status.success() {
            debug!(
                container_id = %handle.handle_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker rm reported an error"
            );
        }
        Ok(())
    }
}
