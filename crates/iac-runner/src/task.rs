// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task data model.
//!
//! [`TaskRequest`] is what callers submit. [`TaskHandle`] is the runtime record
//! kept by the [`TaskRegistry`](crate::registry::TaskRegistry).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Execution mode of a task. Closed set; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// `terraform plan`
    Plan,
    /// `terraform apply -auto-approve`
    Apply,
    /// `terraform destroy -auto-approve`
    Destroy,
    /// `terraform state pull`
    Pull,
}

impl Mode {
    /// Mode name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Plan => "plan",
            Mode::Apply => "apply",
            Mode::Destroy => "destroy",
            Mode::Pull => "pull",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Mode::Plan),
            "apply" => Ok(Mode::Apply),
            "destroy" => Ok(Mode::Destroy),
            "pull" => Ok(Mode::Pull),
            other => Err(Error::Validation(format!("unrecognized mode '{}'", other))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_mode() -> String {
    "plan".to_string()
}

fn default_backend() -> String {
    "consul".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

/// Remote state configuration, passed through to the generated script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStoreConfig {
    /// Persist resulting state to the backend.
    #[serde(default)]
    pub save_state: bool,
    /// Backend kind.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Connection scheme.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Key/path of the state inside the backend.
    #[serde(default)]
    pub state_key: String,
    /// Backend address.
    #[serde(default)]
    pub state_backend_address: String,
    /// Take a distributed lock before mutating state.
    #[serde(default = "default_true")]
    pub lock: bool,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            save_state: false,
            backend: default_backend(),
            scheme: default_scheme(),
            state_key: String::new(),
            state_backend_address: String::new(),
            lock: true,
        }
    }
}

/// A request to execute one infrastructure-change workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Source repository URL.
    #[serde(default)]
    pub repo: String,
    /// Branch to check out.
    #[serde(default)]
    pub repo_branch: String,
    /// Commit to pin the run to.
    #[serde(default)]
    pub repo_commit: String,
    /// Template identity.
    #[serde(default)]
    pub template_uuid: String,
    /// Task identity.
    #[serde(default)]
    pub task_id: String,
    /// Container image; falls back to the configured default.
    #[serde(default)]
    pub docker_image: Option<String>,
    /// Remote state configuration.
    #[serde(default)]
    pub state_store: StateStoreConfig,
    /// Environment overrides.
    #[serde(default, alias = "Env")]
    pub env: HashMap<String, String>,
    /// Timeout in seconds; `None`/0 means the configured default.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Execution mode name.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Terraform var-file, relative to the repository root.
    #[serde(default)]
    pub varfile: String,
    /// Shell appended verbatim at the end of the script.
    #[serde(default)]
    pub extra: String,
    /// Optional ansible playbook to run after terraform.
    #[serde(default)]
    pub playbook: Option<String>,
}

impl TaskRequest {
    /// Create a request with defaults for everything but the identifiers.
    pub fn new(template_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            repo: String::new(),
            repo_branch: String::new(),
            repo_commit: String::new(),
            template_uuid: template_id.into(),
            task_id: task_id.into(),
            docker_image: None,
            state_store: StateStoreConfig::default(),
            env: HashMap::new(),
            timeout: None,
            mode: default_mode(),
            varfile: String::new(),
            extra: String::new(),
            playbook: None,
        }
    }

    /// Workspace key of this request.
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.template_uuid, &self.task_id)
    }

    /// Parse the mode name.
    pub fn mode(&self) -> Result<Mode> {
        self.mode.parse()
    }

    /// Playbook path, if a non-blank one was supplied.
    pub fn playbook(&self) -> Option<&str> {
        self.playbook.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// Check everything that can be checked without touching disk.
    ///
    /// Returns the parsed mode on success.
    pub fn validate(&self) -> Result<Mode> {
        validate_identifier("template_uuid", &self.template_uuid)?;
        validate_identifier("task_id", &self.task_id)?;
        let mode = self.mode()?;

        validate_single_line("repo", &self.repo)?;
        validate_single_line("repo_branch", &self.repo_branch)?;
        validate_single_line("repo_commit", &self.repo_commit)?;
        validate_single_line("varfile", &self.varfile)?;
        if let Some(image) = &self.docker_image {
            validate_single_line("docker_image", image)?;
        }
        if let Some(playbook) = &self.playbook {
            validate_single_line("playbook", playbook)?;
        }

        for key in self.env.keys() {
            if key.is_empty()
                || key.contains('=')
                || key.chars().any(|c| c.is_whitespace() || c == '\0')
            {
                return Err(Error::Validation(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }
        if self.env.values().any(|v| v.contains('\0')) {
            return Err(Error::Validation(
                "environment values must not contain NUL".to_string(),
            ));
        }

        let state = &self.state_store;
        validate_single_line("state_store.backend", &state.backend)?;
        validate_single_line("state_store.scheme", &state.scheme)?;
        validate_single_line("state_store.state_key", &state.state_key)?;
        validate_single_line(
            "state_store.state_backend_address",
            &state.state_backend_address,
        )?;
        if state.save_state {
            if state.state_key.is_empty() {
                return Err(Error::Validation(
                    "state_store.state_key is required when save_state is set".to_string(),
                ));
            }
            if state.state_backend_address.is_empty() {
                return Err(Error::Validation(
                    "state_store.state_backend_address is required when save_state is set"
                        .to_string(),
                ));
            }
            if !state
                .backend
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                || state.backend.is_empty()
            {
                return Err(Error::Validation(format!(
                    "invalid state backend '{}'",
                    state.backend
                )));
            }
        }

        Ok(mode)
    }
}

/// An identifier becomes a directory name and part of container mount and
/// name arguments, so it is limited to `[A-Za-z0-9_.-]` and may not start with
/// a dot.
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    if value.starts_with('.')
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(Error::Validation(format!(
            "{} '{}' is not a valid identifier",
            field, value
        )));
    }
    Ok(())
}

fn validate_single_line(field: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(Error::Validation(format!(
            "{} must be a single line",
            field
        )));
    }
    Ok(())
}

/// Identity of a task workspace: `(template_id, task_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    /// Template identity
    pub template_id: String,
    /// Task identity
    pub task_id: String,
}

impl TaskKey {
    /// Create a key.
    pub fn new(template_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.template_id, self.task_id)
    }
}

/// Lifecycle status of a task.
///
/// ```text
/// not-started ──► running ──► succeeded | failed | timed-out | canceled
/// ```
///
/// Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Registered, execution unit not started yet
    NotStarted,
    /// Execution unit is running
    Running,
    /// Exited with code 0
    Succeeded,
    /// Exited non-zero, or could not be started
    Failed,
    /// Killed after exceeding its timeout
    TimedOut,
    /// Terminated on caller request
    Canceled,
}

impl TaskStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Canceled
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::NotStarted => next != TaskStatus::NotStarted,
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Get the status string
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not-started",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed-out",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of a task, owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Task identity
    pub task_id: String,
    /// Template identity
    pub template_id: String,
    /// Container/process identifier, set once launched
    pub container_id: Option<String>,
    /// Host path of the workspace
    pub workspace: PathBuf,
    /// When the task was submitted
    pub created_at: DateTime<Utc>,
    /// When the execution unit was started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was committed
    pub finished_at: Option<DateTime<Utc>>,
    /// Last known status
    pub status: TaskStatus,
    /// Exit code of the execution unit, when it exited on its own
    pub exit_code: Option<i32>,
    /// Failure description for failed-to-start or killed tasks
    pub error: Option<String>,
    /// Log line offset last delivered to a caller
    pub log_offset: usize,
}

impl TaskHandle {
    /// Create a not-started handle.
    pub fn new(key: &TaskKey, workspace: PathBuf) -> Self {
        Self {
            task_id: key.task_id.clone(),
            template_id: key.template_id.clone(),
            container_id: None,
            workspace,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: TaskStatus::NotStarted,
            exit_code: None,
            error: None,
            log_offset: 0,
        }
    }

    /// Workspace key of this handle.
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.template_id, &self.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TaskRequest {
        TaskRequest::new("tpl-1", "task-1")
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"template_uuid": "tpl", "task_id": "t1"}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.mode, "plan");
        assert_eq!(req.state_store.backend, "consul");
        assert_eq!(req.state_store.scheme, "http");
        assert!(req.state_store.lock);
        assert!(!req.state_store.save_state);
        assert!(req.timeout.is_none());
        assert!(req.docker_image.is_none());
    }

    #[test]
    fn test_deserialize_legacy_env_field() {
        let json = r#"{"template_uuid": "tpl", "task_id": "t1", "Env": {"A": "1"}}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("plan".parse::<Mode>().unwrap(), Mode::Plan);
        assert_eq!("apply".parse::<Mode>().unwrap(), Mode::Apply);
        assert_eq!("destroy".parse::<Mode>().unwrap(), Mode::Destroy);
        assert_eq!("pull".parse::<Mode>().unwrap(), Mode::Pull);
        assert!(matches!("Apply".parse::<Mode>(), Err(Error::Validation(_))));
        assert!(matches!("".parse::<Mode>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_requires_identifiers() {
        let mut req = request();
        req.task_id = String::new();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));

        let mut req = request();
        req.template_uuid = "  ".to_string();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        for bad in ["../etc", "a/b", "..", ".hidden", "a\\b"] {
            let mut req = request();
            req.task_id = bad.to_string();
            assert!(req.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_validate_rejects_mount_syntax_in_identifiers() {
        for bad in ["tpl:ro", "a,b", "tpl task", "tpl$x", "zaż"] {
            let mut req = request();
            req.template_uuid = bad.to_string();
            assert!(
                matches!(req.validate(), Err(Error::Validation(_))),
                "{} should be rejected",
                bad
            );
        }

        let mut req = request();
        req.template_uuid = "3f2a9c1e-7b4d-4e5f-9a8b-0c1d2e3f4a5b".to_string();
        req.task_id = "task_1.retry-2".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_state_store_invariant() {
        let mut req = request();
        req.state_store.save_state = true;
        assert!(req.validate().is_err());

        req.state_store.state_key = "iac/tpl-1".to_string();
        assert!(req.validate().is_err());

        req.state_store.state_backend_address = "consul:8500".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_multiline_fields() {
        let mut req = request();
        req.varfile = "prod.tfvars\nrm -rf /".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_allows_multiline_extra() {
        let mut req = request();
        req.extra = "echo one\necho two".to_string();
        assert_eq!(req.validate().unwrap(), Mode::Plan);
    }

    #[test]
    fn test_validate_rejects_bad_env_names() {
        let mut req = request();
        req.env.insert("A=B".to_string(), "x".to_string());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::TimedOut));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::NotStarted));
        for terminal in [
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::TimedOut,
            TaskStatus::Canceled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Succeeded));
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::TimedOut).unwrap(),
            "\"timed-out\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::NotStarted).unwrap(),
            "\"not-started\""
        );
    }
}
