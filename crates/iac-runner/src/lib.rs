// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! iac-runner - Infrastructure-as-Code Task Runner
//!
//! Accepts requests to run a Terraform plan/apply/destroy/state pull (optionally
//! followed by an Ansible playbook), runs each one as an isolated execution
//! unit, and lets callers follow its log and outcome while it runs and after it
//! completes.
//!
//! # Architecture
//!
//! ```text
//!              POST /api/v1/task/run
//!                       │
//!                       ▼
//!   ┌────────────────────────────────────────────────┐
//!   │                  TaskService                   │
//!   │  validate ─► CommandBuilder ─► TaskRegistry    │
//!   │  WorkspaceManager ─► ScriptGenerator           │
//!   │  Launcher::launch ─► supervise()               │
//!   └────────────────────────────────────────────────┘
//!                       │ docker run / sh
//!                       ▼
//!   {storage}/{template}/{task}/run.sh  >>  runner.log
//!                       ▲
//!                       │ read_since(offset)
//!   status / log polls ─┘ (LogStore, TaskRegistry)
//! ```
//!
//! # Task Status State Machine
//!
//! ```text
//!   not-started ──► running ──► succeeded
//!        │             ├──────► failed
//!        │             ├──────► timed-out
//!        │             └──────► canceled
//!        └──► failed (launch fault)
//! ```
//!
//! Terminal states are sinks: once committed, no caller observes a task
//! leaving them.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUNNER_PORT` | `19030` | HTTP port |
//! | `RUNNER_STORAGE_PATH` | `var/storage` | Workspace storage root |
//! | `RUNNER_DEFAULT_IMAGE` | `mt5225/tf-ansible:v0.0.1` | Image for requests naming none |
//! | `RUNNER_LAUNCHER` | `docker` | `docker` or `process` |
//! | `RUNNER_DOCKER_BIN` | `docker` | Docker CLI binary |
//! | `RUNNER_DOCKER_RUN_ARGS` | - | Extra `docker run` arguments, whitespace separated |
//! | `RUNNER_CONTAINER_WORKDIR` | `/iac/workspace` | In-container workspace mount point |
//! | `RUNNER_PLUGIN_DIR` | - | `terraform init -plugin-dir` |
//! | `RUNNER_ANSIBLE_INVENTORY` | - | `ansible-playbook -i` |
//! | `RUNNER_DEFAULT_TIMEOUT_SECS` | `600` | Timeout for requests giving none |
//! | `RUNNER_MAX_LOG_LINES` | `1000` | Cap on lines per log poll |
//! | `RUNNER_RETENTION_HOURS` | `168` | Retention of finished tasks |
//! | `RUNNER_CLEANUP_INTERVAL_SECS` | `3600` | Retention sweep period |

#![deny(missing_docs)]

/// Runner configuration loaded from environment variables.
pub mod config;

/// Error types for runner operations.
pub mod error;

/// Task requests, handles and statuses.
pub mod task;

/// Per-task workspace directories.
pub mod workspace;

/// Script generation from task requests.
pub mod script;

/// Execution spec construction (image, environment, command).
pub mod command;

/// Execution backends (docker, native process, mock) and supervision.
pub mod runner;

/// Incremental task log reads.
pub mod log_store;

/// Task registry.
pub mod registry;

/// Task submission, status, log and cancel operations.
pub mod service;

/// HTTP API.
pub mod server;

/// Background worker reclaiming finished tasks.
pub mod cleanup_worker;

/// Embeddable runtime.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
