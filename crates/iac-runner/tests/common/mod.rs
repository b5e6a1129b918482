// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for iac-runner integration tests.
//!
//! Runs tasks through the native process launcher with stand-in `terraform`
//! and `ansible-playbook` executables that echo their arguments, so whole
//! submissions can be exercised without any IaC tooling installed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use iac_runner::config::{Config, LauncherKind};
use iac_runner::runner::ProcessLauncher;
use iac_runner::service::TaskService;
use iac_runner::task::{TaskHandle, TaskRequest};

/// Stand-in for terraform. `apply` runs for `FAKE_APPLY_SECS` seconds.
const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "terraform $*"
if [ "$1" = "apply" ] && [ -n "$FAKE_APPLY_SECS" ]; then
    echo "applying"
    sleep "$FAKE_APPLY_SECS"
    echo "apply finished"
fi
if [ "$1" = "plan" ] && [ -n "$FAKE_PLAN_LINES" ]; then
    i=1
    while [ "$i" -le "$FAKE_PLAN_LINES" ]; do
        echo "plan line $i"
        sleep 0.05
        i=$((i + 1))
    done
fi
"#;

const FAKE_ANSIBLE: &str = "#!/bin/sh\necho \"ansible-playbook $*\"\n";

/// Test context owning a storage root, fake tools and a service.
pub struct TestContext {
    pub service: Arc<TaskService>,
    pub storage: PathBuf,
    pub bin_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = temp_dir.path().join("storage");
        let bin_dir = temp_dir.path().join("bin");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::create_dir_all(&bin_dir).unwrap();
        write_executable(&bin_dir.join("terraform"), FAKE_TERRAFORM);
        write_executable(&bin_dir.join("ansible-playbook"), FAKE_ANSIBLE);

        let config = Config {
            storage_path: storage.clone(),
            launcher: LauncherKind::Process,
            default_timeout: Duration::from_secs(30),
            max_log_lines: 100,
            ..Default::default()
        };
        let service = Arc::new(TaskService::new(&config, Arc::new(ProcessLauncher::new())));

        Self {
            service,
            storage,
            bin_dir,
            _temp_dir: temp_dir,
        }
    }

    /// A request whose environment puts the fake tools first on PATH.
    pub fn request(&self, template_id: &str, task_id: &str) -> TaskRequest {
        let mut request = TaskRequest::new(template_id, task_id);
        request.env.insert(
            "PATH".to_string(),
            format!("{}:/usr/local/bin:/usr/bin:/bin", self.bin_dir.display()),
        );
        request
    }

    pub fn workspace(&self, template_id: &str, task_id: &str) -> PathBuf {
        self.storage.join(template_id).join(task_id)
    }

    pub fn log(&self, template_id: &str, task_id: &str) -> String {
        std::fs::read_to_string(self.workspace(template_id, task_id).join("runner.log"))
            .unwrap_or_default()
    }

    pub async fn wait(&self, task_id: &str, limit: Duration) -> TaskHandle {
        tokio::time::timeout(
            limit,
            self.service
                .wait_terminal(task_id, Duration::from_millis(20)),
        )
        .await
        .expect("task did not reach a terminal status in time")
        .unwrap()
    }
}
