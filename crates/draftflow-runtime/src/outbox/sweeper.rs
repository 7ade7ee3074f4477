use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use draftflow_core::config::QueueConfig;

use super::OutboundQueue;

/// Periodic driver for [`OutboundQueue::sweep`].
///
/// Several sweepers may run against the same store; claim leases keep
/// them from sending the same message twice.
pub struct Sweeper {
    queue: Arc<OutboundQueue>,
    interval: Duration,
    batch_size: u32,
}

impl Sweeper {
    pub fn new(queue: Arc<OutboundQueue>, config: &QueueConfig) -> Self {
        Self {
            queue,
            interval: config.sweep_interval(),
            batch_size: config.batch_size,
        }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep on every tick until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        tracing::info!(
            interval = ?self.interval,
            batch_size = self.batch_size,
            "Queue sweeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.queue.sweep(self.batch_size).await {
                        tracing::error!(error = %e, "Queue sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Queue sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use draftflow_core::outbox::NewMessage;
    use draftflow_core::testing::{MemoryStore, RecordingSender};

    use super::*;

    #[tokio::test]
    async fn test_sweeper_delivers_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = Arc::new(OutboundQueue::new(
            store,
            sender.clone(),
            QueueConfig::default(),
        ));
        queue
            .enqueue(NewMessage::new("user-1", serde_json::json!({}), 3))
            .await
            .unwrap();

        let sweeper = Sweeper::new(queue.clone(), &QueueConfig::default())
            .with_interval(Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sweeper.run(shutdown).await })
        };

        for _ in 0..100 {
            if !sender.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(sender.delivered().len(), 1);
        assert_eq!(queue.stats().await.unwrap().sent, 1);
    }
}
