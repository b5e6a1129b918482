// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script generation.
//!
//! Everything an execution unit runs is the `run.sh` written into its workspace.
//! The script locates itself (`cd "$(dirname "$0")"`), so the same file works
//! whether the workspace is bind-mounted into a container or run in place.

use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::{Mode, StateStoreConfig, TaskRequest};

/// Directory (relative to the workspace) the repository is cloned into.
pub const CODE_DIR: &str = "code";

/// Name of the generated terraform backend file.
pub const BACKEND_FILE_NAME: &str = "_backend.tf";

const HEREDOC_MARKER: &str = "IAC_RUNNER_BACKEND_EOF";

/// Quote a value for POSIX sh so it is always one literal word.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Escape a value for a double-quoted HCL string.
fn hcl_string(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "$${")
        .replace("%{", "%%{");
    format!("\"{}\"", escaped)
}

/// Options shared by every generated script.
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// `terraform init -plugin-dir` value
    pub plugin_dir: Option<String>,
    /// `ansible-playbook -i` value
    pub ansible_inventory: Option<String>,
}

/// Renders task requests into executable scripts.
#[derive(Debug, Clone, Default)]
pub struct ScriptGenerator {
    options: ScriptOptions,
}

impl ScriptGenerator {
    /// Create a generator.
    pub fn new(options: ScriptOptions) -> Self {
        Self { options }
    }

    /// The tool invocation for a mode.
    pub fn mode_invocation(mode: Mode, varfile: &str) -> String {
        let var_file = if varfile.is_empty() {
            String::new()
        } else {
            format!(" -var-file {}", shell_quote(varfile))
        };
        match mode {
            Mode::Plan => format!("terraform plan -input=false{}", var_file),
            Mode::Apply => format!("terraform apply -auto-approve -input=false{}", var_file),
            Mode::Destroy => format!("terraform destroy -auto-approve -input=false{}", var_file),
            Mode::Pull => "terraform state pull".to_string(),
        }
    }

    /// Build the script text for a request.
    pub fn script_content(&self, request: &TaskRequest) -> Result<String> {
        let mode = request.mode()?;
        let mut script = String::new();

        // writeln! into a String cannot fail
        let _ = writeln!(script, "#!/bin/sh");
        let _ = writeln!(
            script,
            "# iac-runner task {} (mode: {})",
            request.key(),
            mode
        );
        let _ = writeln!(script, "set -e");
        let _ = writeln!(script, "cd \"$(dirname \"$0\")\"");
        script.push('\n');

        // Environment setup
        if !request.repo.is_empty() {
            let _ = writeln!(script, "rm -rf {}", CODE_DIR);
            let _ = writeln!(
                script,
                "git clone {} {}",
                shell_quote(&request.repo),
                CODE_DIR
            );
            let _ = writeln!(script, "cd {}", CODE_DIR);
            if !request.repo_branch.is_empty() {
                let _ = writeln!(script, "git checkout {}", shell_quote(&request.repo_branch));
            }
            if !request.repo_commit.is_empty() {
                let _ = writeln!(
                    script,
                    "git checkout -b run_branch {}",
                    shell_quote(&request.repo_commit)
                );
            }
        }
        if request.state_store.save_state {
            script.push_str(&backend_block(&request.state_store));
        }
        match &self.options.plugin_dir {
            Some(dir) => {
                let _ = writeln!(
                    script,
                    "terraform init -input=false -plugin-dir {}",
                    shell_quote(dir)
                );
            }
            None => {
                let _ = writeln!(script, "terraform init -input=false");
            }
        }
        script.push('\n');

        let _ = writeln!(script, "{}", Self::mode_invocation(mode, &request.varfile));

        if let Some(playbook) = request.playbook() {
            let inventory = match &self.options.ansible_inventory {
                Some(inv) => format!(" -i {}", shell_quote(inv)),
                None => String::new(),
            };
            let _ = writeln!(
                script,
                "ansible-playbook{} {}",
                inventory,
                shell_quote(playbook)
            );
        }

        if !request.extra.trim().is_empty() {
            script.push('\n');
            script.push_str(&request.extra);
            if !request.extra.ends_with('\n') {
                script.push('\n');
            }
        }

        Ok(script)
    }

    /// Render the request into an executable script at `script_path`.
    ///
    /// An unrecognized mode is rejected before anything is written.
    pub async fn render(&self, request: &TaskRequest, script_path: &Path) -> Result<()> {
        let content = self.script_content(request)?;

        // Write-then-rename so a half-written script is never visible
        let tmp_path = script_path.with_extension("sh.tmp");
        let storage_err = |e: std::io::Error| {
            Error::Storage(format!(
                "failed to write script {}: {}",
                script_path.display(),
                e
            ))
        };
        tokio::fs::write(&tmp_path, content.as_bytes())
            .await
            .map_err(storage_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(storage_err)?;
        }
        tokio::fs::rename(&tmp_path, script_path)
            .await
            .map_err(storage_err)?;

        debug!(
            task_id = %request.task_id,
            path = %script_path.display(),
            bytes = content.len(),
            "Rendered task script"
        );
        Ok(())
    }
}

fn backend_block(state: &StateStoreConfig) -> String {
    let mut block = String::new();
    let _ = writeln!(block, "cat > {} <<'{}'", BACKEND_FILE_NAME, HEREDOC_MARKER);
    let _ = writeln!(block, "terraform {{");
    let _ = writeln!(block, "  backend {} {{", hcl_string(&state.backend));
    let _ = writeln!(
        block,
        "    address = {}",
        hcl_string(&state.state_backend_address)
    );
    let _ = writeln!(block, "    scheme  = {}", hcl_string(&state.scheme));
    let _ = writeln!(block, "    path    = {}", hcl_string(&state.state_key));
    let _ = writeln!(block, "    lock    = {}", state.lock);
    let _ = writeln!(block, "  }}");
    let _ = writeln!(block, "}}");
    let _ = writeln!(block, "{}", HEREDOC_MARKER);
    block
}
