use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use draftflow_core::config::QueueConfig;
use draftflow_core::error::{DraftflowError, Result};
use draftflow_core::outbox::{NewMessage, NotificationSender, QueueStats, QueuedMessage};
use draftflow_core::retry::{self, RetryPolicy};
use draftflow_core::store::{FailureOutcome, OutboxStore};

/// Deliveries in flight per sweep.
const SWEEP_CONCURRENCY: usize = 8;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Messages claimed by this sweep.
    pub processed: u64,
    pub sent: u64,
    /// Failed attempts left pending for a later sweep.
    pub retried: u64,
    /// Messages that reached `failed` in this sweep.
    pub failed: u64,
    /// Claimed messages whose outcome could not be recorded.
    pub skipped: u64,
    /// Pending messages still due after the sweep.
    pub remaining: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Retried,
    Failed,
    LostClaim,
}

/// Durable outbound message queue.
///
/// Messages are persisted before any delivery attempt. A sweep claims due
/// rows with a lease token before sending, so concurrent sweeps never
/// attempt the same message twice while a lease is live.
pub struct OutboundQueue {
    store: Arc<dyn OutboxStore>,
    sender: Arc<dyn NotificationSender>,
    config: QueueConfig,
    backoff: RetryPolicy,
}

impl OutboundQueue {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sender: Arc<dyn NotificationSender>,
        config: QueueConfig,
    ) -> Self {
        let backoff = config.backoff_policy();
        Self {
            store,
            sender,
            config,
            backoff,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist a message for eventual delivery.
    ///
    /// With a dedupe key that was already used, returns the existing id.
    pub async fn enqueue(&self, message: NewMessage) -> Result<Uuid> {
        let (id, _) = self.insert(message).await?;
        Ok(id)
    }

    /// Persist a message, then try one delivery right away.
    ///
    /// Returns the id and whether the message is now sent. Any failure
    /// leaves the message to the sweep.
    pub async fn enqueue_and_try_send(&self, message: NewMessage) -> Result<(Uuid, bool)> {
        let (id, inserted) = self.insert(message).await?;
        if !inserted {
            return Ok((id, false));
        }

        let now = Utc::now();
        let token = Uuid::new_v4();
        let lease_until = now + to_chrono(self.config.claim_lease())?;

        let Some(message) = self
            .store
            .claim_message(id, now, lease_until, token)
            .await?
        else {
            return Ok((id, false));
        };

        let outcome = self.deliver(&message, token, now).await?;
        Ok((id, outcome == Outcome::Sent))
    }

    /// Deliver up to `batch_size` due messages.
    pub async fn sweep(&self, batch_size: u32) -> Result<SweepStats> {
        self.sweep_at(batch_size, Utc::now()).await
    }

    /// Sweep as of `now`. Backoff and lease times are computed from `now`.
    pub async fn sweep_at(&self, batch_size: u32, now: DateTime<Utc>) -> Result<SweepStats> {
        let token = Uuid::new_v4();
        let lease_until = now + to_chrono(self.config.claim_lease())?;

        let claimed = self
            .store
            .claim_due(now, lease_until, i64::from(batch_size), token)
            .await?;

        let mut stats = SweepStats {
            processed: claimed.len() as u64,
            ..Default::default()
        };

        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), sweep = %token, "Claimed due messages");
        }

        let outcomes: Vec<(Uuid, Result<Outcome>)> = stream::iter(claimed)
            .map(|message| async move { (message.id, self.deliver(&message, token, now).await) })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for (message_id, outcome) in outcomes {
            match outcome {
                Ok(Outcome::Sent) => stats.sent += 1,
                Ok(Outcome::Retried) => stats.retried += 1,
                Ok(Outcome::Failed) => stats.failed += 1,
                Ok(Outcome::LostClaim) => stats.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        message_id = %message_id,
                        error = %e,
                        "Failed to record delivery outcome"
                    );
                    stats.skipped += 1;
                }
            }
        }

        stats.remaining = self.store.count_due(now).await?;

        if stats.processed > 0 {
            tracing::info!(
                processed = stats.processed,
                sent = stats.sent,
                retried = stats.retried,
                failed = stats.failed,
                remaining = stats.remaining,
                "Queue sweep finished"
            );
        }

        Ok(stats)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.count_by_status().await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        self.store.get_message(id).await
    }

    async fn insert(&self, message: NewMessage) -> Result<(Uuid, bool)> {
        let record = message.into_record(Utc::now());
        let (id, inserted) = self.store.insert_message(&record).await?;

        if inserted {
            tracing::debug!(
                message_id = %id,
                destination = %record.destination,
                "Message enqueued"
            );
        } else {
            tracing::debug!(
                message_id = %id,
                dedupe_key = ?record.dedupe_key,
                "Duplicate enqueue ignored"
            );
        }
        Ok((id, inserted))
    }

    /// One attempt for a claimed message. Attempt counting belongs to the
    /// queue, so the transport gets a single-attempt policy.
    async fn deliver(
        &self,
        message: &QueuedMessage,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let attempt = retry::run(&RetryPolicy::single_attempt(), |_| {
            self.sender.send(&message.destination, &message.payload)
        })
        .await;

        let error = match attempt {
            Ok(()) => {
                if !self.store.mark_sent(message.id, token, Utc::now().max(now)).await? {
                    return Ok(self.lost_claim(message));
                }
                tracing::debug!(
                    message_id = %message.id,
                    destination = %message.destination,
                    attempt = message.attempts + 1,
                    "Message sent"
                );
                return Ok(Outcome::Sent);
            }
            Err(e) => e.into_inner(),
        };

        let attempts = message.attempts + 1;
        let terminal = error.is_permanent() || attempts >= message.max_attempts;

        let outcome = if terminal {
            FailureOutcome::Terminal
        } else {
            let delay = self.backoff.calculate_backoff(attempts.unsigned_abs());
            FailureOutcome::Retry {
                next_attempt_at: now + to_chrono(delay)?,
            }
        };

        if !self
            .store
            .record_failure(message.id, token, &error.to_string(), outcome)
            .await?
        {
            return Ok(self.lost_claim(message));
        }

        match outcome {
            FailureOutcome::Terminal => {
                tracing::warn!(
                    message_id = %message.id,
                    destination = %message.destination,
                    attempts,
                    error = %error,
                    "Message delivery failed permanently"
                );
                Ok(Outcome::Failed)
            }
            FailureOutcome::Retry { next_attempt_at } => {
                tracing::warn!(
                    message_id = %message.id,
                    destination = %message.destination,
                    attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "Message delivery failed, will retry"
                );
                Ok(Outcome::Retried)
            }
        }
    }

    fn lost_claim(&self, message: &QueuedMessage) -> Outcome {
        tracing::warn!(
            message_id = %message.id,
            "Claim lease expired before the outcome was recorded"
        );
        Outcome::LostClaim
    }
}

fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| DraftflowError::Config(format!("Duration out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use draftflow_core::outbox::{DeliveryError, MessageStatus};
    use draftflow_core::testing::{MemoryStore, RecordingSender};
    use serde_json::json;

    use super::*;

    fn queue(store: Arc<MemoryStore>, sender: Arc<RecordingSender>) -> OutboundQueue {
        OutboundQueue::new(store, sender, QueueConfig::default())
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_message() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = queue(store.clone(), sender.clone());

        let id = queue
            .enqueue(NewMessage::new("user-1", json!({"n": 1}), 4))
            .await
            .unwrap();

        let message = queue.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 0);
        sender.assert_nothing_attempted();
    }

    #[tokio::test]
    async fn test_dedupe_key_yields_one_message() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), Arc::new(RecordingSender::new()));

        let first = queue
            .enqueue(NewMessage::new("user-1", json!({}), 4).with_dedupe_key("i:decision"))
            .await
            .unwrap();
        let second = queue
            .enqueue(NewMessage::new("user-1", json!({}), 4).with_dedupe_key("i:decision"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_sends_due_messages() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = queue(store.clone(), sender.clone());

        for n in 0..3 {
            queue
                .enqueue(NewMessage::new("user-1", json!({"n": n}), 4))
                .await
                .unwrap();
        }

        let stats = queue.sweep(10).await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.remaining, 0);
        assert_eq!(sender.delivered().len(), 3);

        let counts = queue.stats().await.unwrap();
        assert_eq!(counts.sent, 3);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, Arc::new(RecordingSender::new()));

        for n in 0..5 {
            queue
                .enqueue(NewMessage::new("user-1", json!({"n": n}), 4))
                .await
                .unwrap();
        }

        let stats = queue.sweep(2).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.remaining, 3);
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = queue(store.clone(), sender.clone());

        let id = queue
            .enqueue(NewMessage::new("user-1", json!({}), 4))
            .await
            .unwrap();
        sender.fail_next(1);

        let now = Utc::now();
        let stats = queue.sweep_at(10, now).await.unwrap();
        assert_eq!(stats.retried, 1);

        let message = queue.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.next_attempt_at, now + chrono::Duration::minutes(5));
        assert!(message.last_error.is_some());

        // Not due yet.
        let stats = queue.sweep_at(10, now + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = queue(store.clone(), sender.clone());

        let id = queue
            .enqueue(NewMessage::new("bounced", json!({}), 4))
            .await
            .unwrap();
        sender.fail_destination("bounced", DeliveryError::Permanent("no such mailbox".into()));

        let stats = queue.sweep(10).await.unwrap();
        assert_eq!(stats.failed, 1);

        let message = queue.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.attempts, 1);
    }

    #[tokio::test]
    async fn test_enqueue_and_try_send() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let queue = queue(store.clone(), sender.clone());

        let (id, sent) = queue
            .enqueue_and_try_send(NewMessage::new("user-1", json!({}), 4))
            .await
            .unwrap();
        assert!(sent);
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );

        sender.fail_next(1);
        let (id, sent) = queue
            .enqueue_and_try_send(NewMessage::new("user-2", json!({}), 4))
            .await
            .unwrap();
        assert!(!sent);
        let message = queue.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 1);
    }
}
