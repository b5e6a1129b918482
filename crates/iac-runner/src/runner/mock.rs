// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Simulates execution units without running containers or processes. Each
//! launch writes the configured log lines into the task log and "exits" with
//! the configured code after the configured delay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};

use super::traits::*;
use crate::command::ExecutionSpec;

/// Exit code reported for killed mock units (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Mock launcher for testing.
pub struct MockLauncher {
    units: Arc<Mutex<HashMap<String, watch::Sender<Option<i32>>>>>,
    launched: Arc<Mutex<Vec<ExecutionSpec>>>,
    next_id: AtomicU64,
    /// Simulated execution time
    pub execution_delay: Duration,
    /// Exit code units finish with
    pub exit_code: i32,
    /// If true, units run until cancelled
    pub never_complete: bool,
    /// If set, every launch fails with this message
    pub launch_error: Option<String>,
    /// Lines written to the task log at launch
    pub log_lines: Vec<String>,
    /// If set, each launch waits for a notification before starting the unit
    pub launch_gate: Option<Arc<Notify>>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    /// Create a mock launcher whose units succeed quickly.
    pub fn new() -> Self {
        Self {
            units: Arc::new(Mutex::new(HashMap::new())),
            launched: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            execution_delay: Duration::from_millis(10),
            exit_code: 0,
            never_complete: false,
            launch_error: None,
            log_lines: Vec::new(),
            launch_gate: None,
        }
    }

    /// Create a mock launcher whose units exit with `code`.
    pub fn exiting_with(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::new()
        }
    }

    /// Create a mock launcher whose units run until cancelled.
    pub fn never_completing() -> Self {
        Self {
            never_complete: true,
            ..Self::new()
        }
    }

    /// Create a mock launcher that cannot start anything.
    pub fn failing_launch(message: impl Into<String>) -> Self {
        Self {
            launch_error: Some(message.into()),
            ..Self::new()
        }
    }

    /// Specs passed to `launch`, in order.
    pub async fn launched(&self) -> Vec<ExecutionSpec> {
        self.launched.lock().await.clone()
    }

    /// Finish a running unit with an exit code.
    pub async fn complete(&self, handle_id: &str, code: i32) {
        if let Some(tx) = self.units.lock().await.get(handle_id) {
            tx.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(code);
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    fn mount_dir(&self) -> Option<&Path> {
        None
    }

    async fn launch(&self, spec: &ExecutionSpec) -> Result<LaunchHandle> {
        if let Some(gate) = &self.launch_gate {
            gate.notified().await;
        }
        if let Some(message) = &self.launch_error {
            return Err(RunnerError::StartFailed(message.clone()));
        }

        if !self.log_lines.is_empty() {
            let mut content = self.log_lines.join("\n");
            content.push('\n');
            tokio::fs::write(&spec.log_path, content).await?;
        }

        let handle_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, _rx) = watch::channel(None);
        self.units.lock().await.insert(handle_id.clone(), tx);
        self.launched.lock().await.push(spec.clone());

        if !self.never_complete {
            let units = self.units.clone();
            let id = handle_id.clone();
            let delay = self.execution_delay;
            let code = self.exit_code;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(tx) = units.lock().await.get(&id) {
                    tx.send_if_modified(|state| {
                        if state.is_none() {
                            *state = Some(code);
                            true
                        } else {
                            false
                        }
                    });
                }
            });
        }

        Ok(LaunchHandle {
            handle_id,
            task_id: spec.key.task_id.clone(),
            started_at: chrono::Utc::now(),
            pid: None,
        })
    }

    async fn wait(&self, handle: &LaunchHandle) -> Result<i32> {
        let mut rx = {
            let units = self.units.lock().await;
            units
                .get(&handle.handle_id)
                .ok_or_else(|| RunnerError::UnknownHandle(handle.handle_id.clone()))?
                .subscribe()
        };
        let code = *rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| RunnerError::Runtime("mock unit dropped".to_string()))?;
        Ok(code.unwrap_or(KILLED_EXIT_CODE))
    }

    async fn cancel(&self, handle: &LaunchHandle) -> Result<()> {
        self.complete(&handle.handle_id, KILLED_EXIT_CODE).await;
        Ok(())
    }
}
