use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Retryable;

/// Failure reported by a notification transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The message stays pending and is retried after backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The message is marked failed without further attempts.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}

/// External delivery mechanism (email, webhook, ...).
///
/// Delivery is at-least-once: implementations may see the same message
/// more than once and receivers must tolerate duplicates.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        destination: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError>;
}
