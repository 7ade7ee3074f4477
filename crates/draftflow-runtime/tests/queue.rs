use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use draftflow_core::config::QueueConfig;
use draftflow_core::outbox::{DeliveryError, MessageStatus, NewMessage};
use draftflow_core::store::OutboxStore;
use draftflow_core::testing::{MemoryStore, RecordingSender};
use draftflow_runtime::OutboundQueue;

fn queue_with(
    config: QueueConfig,
    sender: RecordingSender,
) -> (Arc<MemoryStore>, Arc<RecordingSender>, Arc<OutboundQueue>) {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(sender);
    let queue = Arc::new(OutboundQueue::new(store.clone(), sender.clone(), config));
    (store, sender, queue)
}

#[tokio::test]
async fn test_backoff_is_monotonic_until_failed() {
    let (_, sender, queue) = queue_with(QueueConfig::default(), RecordingSender::new());
    sender.fail_destination("flaky", DeliveryError::Transient("mailbox busy".into()));

    let id = queue
        .enqueue(NewMessage::new("flaky", json!({"n": 1}), 4))
        .await
        .unwrap();

    let mut scheduled = Vec::new();
    let mut now = Utc::now();
    for _ in 0..3 {
        let stats = queue.sweep_at(10, now).await.unwrap();
        assert_eq!(stats.retried, 1);

        let message = queue.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        scheduled.push(message.next_attempt_at - now);
        now = message.next_attempt_at;
    }

    assert_eq!(
        scheduled,
        vec![
            chrono::Duration::minutes(5),
            chrono::Duration::minutes(10),
            chrono::Duration::minutes(20),
        ]
    );

    let stats = queue.sweep_at(10, now).await.unwrap();
    assert_eq!(stats.failed, 1);
    let failed = queue.get(id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(failed.attempts, 4);
    assert!(failed.attempts <= failed.max_attempts);

    // Terminal: later sweeps never touch it again.
    let stats = queue
        .sweep_at(10, now + chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(stats.processed, 0);
    let after = queue.get(id).await.unwrap().unwrap();
    assert_eq!(after.next_attempt_at, failed.next_attempt_at);
    assert_eq!(sender.attempts().len(), 4);
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let config = QueueConfig {
        max_attempts: 6,
        backoff_cap_secs: 600,
        ..QueueConfig::default()
    };
    let (_, sender, queue) = queue_with(config, RecordingSender::new());
    sender.fail_destination("flaky", DeliveryError::Transient("mailbox busy".into()));

    let id = queue
        .enqueue(NewMessage::new("flaky", json!({}), 6))
        .await
        .unwrap();

    let mut delays = Vec::new();
    let mut now = Utc::now();
    for _ in 0..4 {
        queue.sweep_at(10, now).await.unwrap();
        let message = queue.get(id).await.unwrap().unwrap();
        delays.push((message.next_attempt_at - now).num_minutes());
        now = message.next_attempt_at;
    }

    assert_eq!(delays, vec![5, 10, 10, 10]);
}

#[tokio::test]
async fn test_recovered_destination_is_delivered() {
    let (_, sender, queue) = queue_with(QueueConfig::default(), RecordingSender::new());
    sender.fail_destination("flaky", DeliveryError::Transient("mailbox busy".into()));

    let id = queue
        .enqueue(NewMessage::new("flaky", json!({}), 4))
        .await
        .unwrap();

    let now = Utc::now();
    queue.sweep_at(10, now).await.unwrap();
    sender.heal_destination("flaky");

    let later = now + chrono::Duration::minutes(5);
    let stats = queue.sweep_at(10, later).await.unwrap();
    assert_eq!(stats.sent, 1);

    let message = queue.get(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.attempts, 1);
    assert!(message.sent_at.is_some());
    assert_eq!(sender.delivered().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_never_double_send() {
    let (_, sender, queue) = queue_with(
        QueueConfig::default(),
        RecordingSender::new().with_delay(Duration::from_millis(20)),
    );

    let payloads: Vec<_> = (0..20).map(|n| json!({"n": n})).collect();
    for payload in &payloads {
        queue
            .enqueue(NewMessage::new("user-1", payload.clone(), 4))
            .await
            .unwrap();
    }

    let first = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.sweep(15).await })
    };
    let second = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.sweep(15).await })
    };
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.processed + second.processed, 20);
    for payload in &payloads {
        assert_eq!(sender.attempts_with_payload(payload), 1, "payload {}", payload);
    }
    assert_eq!(queue.stats().await.unwrap().sent, 20);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let (store, sender, queue) = queue_with(QueueConfig::default(), RecordingSender::new());
    let id = queue
        .enqueue(NewMessage::new("user-1", json!({}), 4))
        .await
        .unwrap();

    // A sweeper claims the message, then dies.
    let now = Utc::now();
    let crashed = Uuid::new_v4();
    let claimed = store
        .claim_due(now, now + chrono::Duration::minutes(5), 10, crashed)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let stats = queue.sweep_at(10, now).await.unwrap();
    assert_eq!(stats.processed, 0);
    sender.assert_nothing_attempted();

    let stats = queue
        .sweep_at(10, now + chrono::Duration::minutes(6))
        .await
        .unwrap();
    assert_eq!(stats.sent, 1);

    // The stale claim can no longer settle the message.
    assert!(!store.mark_sent(id, crashed, Utc::now()).await.unwrap());
    assert_eq!(sender.delivered().len(), 1);
}

#[tokio::test]
async fn test_sent_messages_are_final() {
    let (store, sender, queue) = queue_with(QueueConfig::default(), RecordingSender::new());
    let (id, sent) = queue
        .enqueue_and_try_send(NewMessage::new("user-1", json!({}), 4))
        .await
        .unwrap();
    assert!(sent);

    let stats = queue
        .sweep_at(10, Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(sender.attempts().len(), 1);
    assert!(store
        .claim_message(id, Utc::now(), Utc::now(), Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[test]
fn test_single_message_queue_stats() {
    let (_, _, queue) = queue_with(QueueConfig::default(), RecordingSender::new());

    let stats = tokio_test::block_on(async {
        queue
            .enqueue(NewMessage::new("user-1", json!({}), 4))
            .await
            .unwrap();
        queue.stats().await.unwrap()
    });

    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total(), 1);
}
