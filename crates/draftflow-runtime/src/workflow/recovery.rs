use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use draftflow_core::config::EngineConfig;

use super::WorkflowEngine;

/// Instances claimed per recovery pass.
const RECOVERY_BATCH: i64 = 50;

/// Periodic driver for [`WorkflowEngine::recover_stalled`].
pub struct StalledRecovery {
    engine: Arc<WorkflowEngine>,
    interval: Duration,
    stale_after: Duration,
    batch_size: i64,
}

impl StalledRecovery {
    pub fn new(engine: Arc<WorkflowEngine>, config: &EngineConfig) -> Self {
        Self {
            engine,
            interval: config.recovery_interval(),
            stale_after: config.stalled_after(),
            batch_size: RECOVERY_BATCH,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Recover stalled instances on every tick until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        tracing::info!(
            interval = ?self.interval,
            stale_after = ?self.stale_after,
            "Stalled workflow recovery started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.engine.recover_stalled(self.stale_after, self.batch_size).await {
                        Ok(stats) if stats.claimed > 0 => {
                            tracing::info!(
                                claimed = stats.claimed,
                                advanced = stats.advanced,
                                failed = stats.failed,
                                errors = stats.errors,
                                "Recovered stalled workflows"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to recover stalled workflows");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Stalled workflow recovery shutting down");
                    break;
                }
            }
        }
    }
}
