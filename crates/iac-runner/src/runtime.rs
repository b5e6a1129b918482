// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for iac-runner.
//!
//! [`RunnerRuntime`] runs the HTTP API and the cleanup worker inside an
//! existing tokio application.
//!
//! ```rust,ignore
//! use iac_runner::config::Config;
//! use iac_runner::runtime::RunnerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = RunnerRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::{Config, LauncherKind};
use crate::runner::{DockerLauncher, DockerLauncherConfig, Launcher, ProcessLauncher};
use crate::server::run_server;
use crate::service::TaskService;

/// Create the launcher selected by configuration.
pub fn launcher_from_config(config: &Config) -> Arc<dyn Launcher> {
    match config.launcher {
        LauncherKind::Docker => Arc::new(DockerLauncher::new(DockerLauncherConfig {
            docker_bin: config.docker_bin.clone(),
            mount_dir: config.container_workdir.clone(),
            extra_run_args: config.docker_run_args.clone(),
        })),
        LauncherKind::Process => Arc::new(ProcessLauncher::new()),
    }
}

/// Builder for creating a [`RunnerRuntime`].
#[derive(Default)]
pub struct RunnerRuntimeBuilder {
    config: Option<Config>,
    launcher: Option<Arc<dyn Launcher>>,
}

impl RunnerRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the launcher.
    ///
    /// Default: chosen from [`Config::launcher`].
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RunnerRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let launcher = self
            .launcher
            .unwrap_or_else(|| launcher_from_config(&config));
        Ok(RunnerRuntimeConfig { config, launcher })
    }
}

/// Configuration for a [`RunnerRuntime`].
pub struct RunnerRuntimeConfig {
    config: Config,
    launcher: Arc<dyn Launcher>,
}

impl RunnerRuntimeConfig {
    /// Start the runtime: recover persisted tasks, then spawn the HTTP server
    /// and the cleanup worker.
    pub async fn start(self) -> Result<RunnerRuntime> {
        tokio::fs::create_dir_all(&self.config.storage_path).await?;

        let service = Arc::new(TaskService::new(&self.config, self.launcher.clone()));
        if let Err(e) = service.recover().await {
            warn!(error = %e, "Failed to recover tasks from storage");
        }

        let cleanup_worker = CleanupWorker::new(
            service.registry().clone(),
            service.workspaces().clone(),
            CleanupWorkerConfig {
                poll_interval: self.config.cleanup_interval,
                max_age: self.config.retention,
            },
        );
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        let listener = TcpListener::bind(self.config.http_addr).await?;
        let bind_addr = listener.local_addr()?;
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_server(listener, service.clone(), server_shutdown_rx));

        info!(
            bind_addr = %bind_addr,
            storage_root = %self.config.storage_path.display(),
            launcher = self.launcher.launcher_type(),
            "RunnerRuntime started"
        );

        Ok(RunnerRuntime {
            server_handle,
            cleanup_handle,
            server_shutdown_tx,
            cleanup_shutdown,
            service,
            bind_addr,
        })
    }
}

/// A running iac-runner instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Tasks still
/// running at shutdown keep their execution units; the next start records them
/// as failed.
pub struct RunnerRuntime {
    server_handle: JoinHandle<Result<()>>,
    cleanup_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    cleanup_shutdown: Arc<Notify>,
    service: Arc<TaskService>,
    bind_addr: SocketAddr,
}

impl RunnerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RunnerRuntimeBuilder {
        RunnerRuntimeBuilder::new()
    }

    /// Address the HTTP API is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The task service backing the API.
    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    /// Gracefully shut down the HTTP server and the cleanup worker.
    pub async fn shutdown(self) -> Result<()> {
        info!("RunnerRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("RunnerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("RunnerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("RunnerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.cleanup_handle.is_finished()
    }
}
