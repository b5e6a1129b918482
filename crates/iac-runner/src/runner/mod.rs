// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - task execution backends.

pub mod docker;
pub mod mock;
pub mod process;
mod supervisor;
mod traits;

pub use docker::{DockerLauncher, DockerLauncherConfig};
pub use mock::MockLauncher;
pub use process::ProcessLauncher;
pub use supervisor::{KILL_GRACE, Outcome, supervise};
pub use traits::*;
