// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for iac-runner.

use thiserror::Error;

/// Runner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The request is malformed or incomplete. Nothing was created.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Workspace creation or script write failed. The task never started.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The execution unit could not be started.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// A task with the same identity was already submitted.
    #[error("Task already exists: {0}")]
    TaskExists(String),

    /// No task with this identity is known.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runner backend failed outside of launch.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),
}

impl Error {
    /// Short machine-readable kind, used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::Storage(_) => "storage",
            Error::Launch(_) => "launch",
            Error::TaskExists(_) => "task_exists",
            Error::TaskNotFound(_) => "task_not_found",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Runner(_) => "runner",
        }
    }
}

/// Result type using runner Error.
pub type Result<T> = std::result::Result<T, Error>;
