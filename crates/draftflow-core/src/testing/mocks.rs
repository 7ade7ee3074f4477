//! Scripted collaborators for engine and queue tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::outbox::{DeliveryError, NotificationSender};
use crate::workflow::{DraftGenerator, GenerationError, WorkflowInput};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Generator that replays a script of outcomes, then a fallback forever.
///
/// ```ignore
/// let generator = ScriptedGenerator::failing_then(2, "Dear Acme");
/// // attempts 1 and 2 fail transiently, attempt 3 returns the draft
/// ```
pub struct ScriptedGenerator {
    script: RwLock<VecDeque<Result<String, GenerationError>>>,
    fallback: Result<String, GenerationError>,
    inputs: RwLock<Vec<WorkflowInput>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    fn with_script(
        script: Vec<Result<String, GenerationError>>,
        fallback: Result<String, GenerationError>,
    ) -> Self {
        Self {
            script: RwLock::new(script.into()),
            fallback,
            inputs: RwLock::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Always returns `draft`.
    pub fn succeeding(draft: impl Into<String>) -> Self {
        Self::with_script(Vec::new(), Ok(draft.into()))
    }

    /// Fails transiently `failures` times, then returns `draft`.
    pub fn failing_then(failures: usize, draft: impl Into<String>) -> Self {
        let script = (1..=failures)
            .map(|n| Err(GenerationError::Transient(format!("upstream timeout #{}", n))))
            .collect();
        Self::with_script(script, Ok(draft.into()))
    }

    /// Always fails with `error`.
    pub fn always_failing(error: GenerationError) -> Self {
        Self::with_script(Vec::new(), Err(error))
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs received, in call order.
    pub fn inputs(&self) -> Vec<WorkflowInput> {
        read(&self.inputs).clone()
    }
}

#[async_trait]
impl DraftGenerator for ScriptedGenerator {
    async fn generate(&self, input: &WorkflowInput) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        write(&self.inputs).push(input.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = write(&self.script).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// A delivery seen by [`RecordingSender`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub destination: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
    /// Whether the sender reported success.
    pub succeeded: bool,
}

/// Sender that records every attempt and fails on demand.
///
/// ```ignore
/// let sender = RecordingSender::new();
/// sender.fail_next(2);
/// queue.sweep(10).await?;
/// sender.assert_attempted("user-1");
/// ```
#[derive(Default)]
pub struct RecordingSender {
    deliveries: RwLock<Vec<Delivery>>,
    fail_next: AtomicU32,
    failing_destinations: RwLock<HashMap<String, DeliveryError>>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every send, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` sends transiently.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every send to `destination` with `error`.
    pub fn fail_destination(&self, destination: impl Into<String>, error: DeliveryError) {
        write(&self.failing_destinations).insert(destination.into(), error);
    }

    /// Stop failing sends to `destination`.
    pub fn heal_destination(&self, destination: &str) {
        write(&self.failing_destinations).remove(destination);
    }

    /// Every attempt, successful or not.
    pub fn attempts(&self) -> Vec<Delivery> {
        read(&self.deliveries).clone()
    }

    /// Successful deliveries only.
    pub fn delivered(&self) -> Vec<Delivery> {
        read(&self.deliveries)
            .iter()
            .filter(|d| d.succeeded)
            .cloned()
            .collect()
    }

    /// Number of attempts carrying exactly `payload`.
    pub fn attempts_with_payload(&self, payload: &serde_json::Value) -> usize {
        read(&self.deliveries)
            .iter()
            .filter(|d| &d.payload == payload)
            .count()
    }

    /// Assert that something was attempted to `destination`.
    pub fn assert_attempted(&self, destination: &str) {
        let deliveries = read(&self.deliveries);
        assert!(
            deliveries.iter().any(|d| d.destination == destination),
            "Expected a send to '{}', got {:?}",
            destination,
            deliveries.iter().map(|d| &d.destination).collect::<Vec<_>>()
        );
    }

    /// Assert that nothing was attempted.
    pub fn assert_nothing_attempted(&self) {
        let deliveries = read(&self.deliveries);
        assert!(
            deliveries.is_empty(),
            "Expected no sends, got {} to {:?}",
            deliveries.len(),
            deliveries.iter().map(|d| &d.destination).collect::<Vec<_>>()
        );
    }

    fn scripted_failure(&self, destination: &str) -> Option<DeliveryError> {
        if let Some(err) = read(&self.failing_destinations).get(destination) {
            return Some(err.clone());
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| DeliveryError::Transient("connection reset".into()))
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(
        &self,
        destination: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.scripted_failure(destination);
        write(&self.deliveries).push(Delivery {
            destination: destination.to_string(),
            payload: payload.clone(),
            at: Utc::now(),
            succeeded: failure.is_none(),
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> WorkflowInput {
        WorkflowInput::GeneralLetter {
            recipient: "Acme".into(),
            topic: "Refund".into(),
            instructions: "Ask politely".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_generator_replays_failures() {
        let generator = ScriptedGenerator::failing_then(2, "draft");
        assert!(generator.generate(&input()).await.is_err());
        assert!(generator.generate(&input()).await.is_err());
        assert_eq!(generator.generate(&input()).await.unwrap(), "draft");
        assert_eq!(generator.generate(&input()).await.unwrap(), "draft");
        assert_eq!(generator.calls(), 4);
        assert_eq!(generator.inputs().len(), 4);
    }

    #[tokio::test]
    async fn test_recording_sender_failures() {
        let sender = RecordingSender::new();
        let payload = serde_json::json!({"n": 1});
        sender.fail_next(1);
        assert!(sender.send("a", &payload).await.is_err());
        assert!(sender.send("a", &payload).await.is_ok());

        sender.fail_destination("b", DeliveryError::Permanent("no such mailbox".into()));
        assert_eq!(
            sender.send("b", &payload).await,
            Err(DeliveryError::Permanent("no such mailbox".into()))
        );

        assert_eq!(sender.attempts().len(), 3);
        assert_eq!(sender.delivered().len(), 1);
        assert_eq!(sender.attempts_with_payload(&payload), 3);
        sender.assert_attempted("b");
    }
}
