// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for iac-runner.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default container image for tasks that do not name one.
pub const DEFAULT_IMAGE: &str = "mt5225/tf-ansible:v0.0.1";

/// Default in-container mount point of a task workspace.
pub const DEFAULT_CONTAINER_WORKDIR: &str = "/iac/workspace";

/// Which backend executes generated scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// One docker container per task.
    Docker,
    /// Native host process per task (development, tests).
    Process,
}

impl FromStr for LauncherKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(LauncherKind::Docker),
            "process" | "native" => Ok(LauncherKind::Process),
            other => Err(ConfigError::InvalidValue("RUNNER_LAUNCHER", other.to_string())),
        }
    }
}

/// Runner configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server address
    pub http_addr: SocketAddr,
    /// Storage root; workspaces live at `{storage_path}/{template_id}/{task_id}`
    pub storage_path: PathBuf,
    /// Image used when a request does not specify one
    pub default_image: String,
    /// Execution backend
    pub launcher: LauncherKind,
    /// Docker CLI binary
    pub docker_bin: String,
    /// Extra `docker run` arguments (network, resource limits, ...)
    pub docker_run_args: Vec<String>,
    /// Fixed path the workspace is mounted at inside the container
    pub container_workdir: PathBuf,
    /// Optional provider plugin directory for `terraform init`
    pub plugin_dir: Option<String>,
    /// Optional ansible inventory for playbook runs
    pub ansible_inventory: Option<String>,
    /// Timeout applied when a request carries none
    pub default_timeout: Duration,
    /// Upper bound on lines returned by a single log poll
    pub max_log_lines: usize,
    /// How long finished tasks are retained before reclamation
    pub retention: Duration,
    /// Period of the retention sweep
    pub cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 19030)),
            storage_path: PathBuf::from("var/storage"),
            default_image: DEFAULT_IMAGE.to_string(),
            launcher: LauncherKind::Docker,
            docker_bin: "docker".to_string(),
            docker_run_args: Vec::new(),
            container_workdir: PathBuf::from(DEFAULT_CONTAINER_WORKDIR),
            plugin_dir: None,
            ansible_inventory: None,
            default_timeout: Duration::from_secs(600),
            max_log_lines: 1000,
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port: u16 = parse_env("RUNNER_PORT", 19030)?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        // Workspaces are bind-mounted into containers, so the root must be absolute
        let storage_raw = std::env::var("RUNNER_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_path);
        let storage_path = if storage_raw.is_absolute() {
            storage_raw
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&storage_raw))
                .unwrap_or(storage_raw)
        };

        let launcher = match std::env::var("RUNNER_LAUNCHER") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.launcher,
        };

        let container_workdir = std::env::var("RUNNER_CONTAINER_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.container_workdir);
        if !container_workdir.is_absolute() {
            return Err(ConfigError::InvalidValue(
                "RUNNER_CONTAINER_WORKDIR",
                container_workdir.display().to_string(),
            ));
        }

        let max_log_lines: usize = parse_env("RUNNER_MAX_LOG_LINES", defaults.max_log_lines)?;
        if max_log_lines == 0 {
            return Err(ConfigError::InvalidValue(
                "RUNNER_MAX_LOG_LINES",
                "0".to_string(),
            ));
        }

        Ok(Self {
            http_addr,
            storage_path,
            default_image: std::env::var("RUNNER_DEFAULT_IMAGE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_image),
            launcher,
            docker_bin: std::env::var("RUNNER_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            docker_run_args: std::env::var("RUNNER_DOCKER_RUN_ARGS")
                .map(|raw| split_args(&raw))
                .unwrap_or(defaults.docker_run_args),
            container_workdir,
            plugin_dir: optional_env("RUNNER_PLUGIN_DIR"),
            ansible_inventory: optional_env("RUNNER_ANSIBLE_INVENTORY"),
            default_timeout: Duration::from_secs(parse_env("RUNNER_DEFAULT_TIMEOUT_SECS", 600)?),
            max_log_lines,
            retention: Duration::from_secs(parse_env::<u64>("RUNNER_RETENTION_HOURS", 168)? * 3600),
            cleanup_interval: Duration::from_secs(parse_env("RUNNER_CLEANUP_INTERVAL_SECS", 3600)?),
        })
    }
}

fn optional_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.trim().is_empty())
}

/// Whitespace-separated argument list; no quoting.
fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var, raw)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be used.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_kind_parse() {
        assert_eq!("docker".parse::<LauncherKind>().unwrap(), LauncherKind::Docker);
        assert_eq!("Process".parse::<LauncherKind>().unwrap(), LauncherKind::Process);
        assert_eq!("native".parse::<LauncherKind>().unwrap(), LauncherKind::Process);
        assert!("podman".parse::<LauncherKind>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_addr.port(), 19030);
        assert_eq!(config.default_image, DEFAULT_IMAGE);
        assert_eq!(config.default_timeout, Duration::from_secs(600));
        assert_eq!(config.container_workdir, PathBuf::from("/iac/workspace"));
    }

    #[test]
    fn test_split_docker_run_args() {
        assert_eq!(
            split_args("  --network iac-net\t--memory 2g "),
            vec!["--network", "iac-net", "--memory", "2g"]
        );
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_parse_env_falls_back_to_default() {
        let value: u64 = parse_env("IAC_RUNNER_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
