// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! iac-runner - Infrastructure-as-Code Task Runner
//!
//! HTTP server that runs terraform/ansible tasks in isolated execution units
//! and serves their status and logs.

use tracing::{info, warn};

use iac_runner::config::Config;
use iac_runner::runtime::RunnerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iac_runner=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        storage_root = %config.storage_path.display(),
        launcher = ?config.launcher,
        default_image = %config.default_image,
        "Starting iac-runner"
    );

    let runtime = RunnerRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "iac-runner ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("iac-runner shut down");

    Ok(())
}
