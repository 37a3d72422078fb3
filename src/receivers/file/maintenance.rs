// SPDX-License-Identifier: Apache-2.0

//! Periodic reconciliation of done jobs against the filesystem.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::receivers::file::registry::JobRegistry;
use crate::receivers::file::supervisor::Supervisor;

/// Runs [`JobRegistry::maintenance`] every `interval` until cancelled.
pub struct MaintenanceLoop {
    registry: Arc<JobRegistry>,
    supervisor: Arc<Supervisor>,
    interval: Duration,
}

impl MaintenanceLoop {
    pub fn new(registry: Arc<JobRegistry>, supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            registry,
            supervisor,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately, right after the startup scan
        ticker.tick().await;

        loop {
            select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let registry = self.registry.clone();
            match tokio::task::spawn_blocking(move || registry.maintenance()).await {
                Ok(Ok(_stats)) => {}
                Ok(Err(e)) => self.supervisor.report("Maintenance failed", e),
                Err(e) => {
                    error!(error = %e, "Maintenance task panicked");
                }
            }
        }
        debug!("Maintenance loop stopped");
    }
}
