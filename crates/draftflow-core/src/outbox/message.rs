use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DraftflowError;

/// Delivery status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Delivered. Immutable from here on.
    Sent,
    /// Gave up. No further automatic attempts.
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for MessageStatus {
    type Err = DraftflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(DraftflowError::Serialization(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

/// A message waiting for, or done with, delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub destination: String,
    pub payload: serde_json::Value,
    /// Enqueueing twice with the same key yields one message.
    pub dedupe_key: Option<String>,
    pub status: MessageStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest time the sweep may pick the message up.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Token of the sweep currently holding the message.
    pub claim_token: Option<Uuid>,
    /// Claim lease expiry. Another sweep may take over afterwards.
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    /// Whether a sweep at `now` may claim this message.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending
            && self.next_attempt_at <= now
            && self.claimed_until.map_or(true, |until| until <= now)
    }

    /// Whether `token` still holds the claim.
    pub fn is_claimed_by(&self, token: Uuid) -> bool {
        self.status == MessageStatus::Pending && self.claim_token == Some(token)
    }
}

/// Input to `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub destination: String,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub max_attempts: i32,
}

impl NewMessage {
    pub fn new(destination: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            destination: destination.into(),
            payload,
            dedupe_key: None,
            max_attempts: i32::try_from(max_attempts.max(1)).unwrap_or(i32::MAX),
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Build the pending record, eligible immediately.
    pub fn into_record(self, now: DateTime<Utc>) -> QueuedMessage {
        QueuedMessage {
            id: Uuid::now_v7(),
            destination: self.destination,
            payload: self.payload,
            dedupe_key: self.dedupe_key,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_attempt_at: now,
            last_error: None,
            claim_token: None,
            claimed_until: None,
            created_at: now,
            sent_at: None,
        }
    }
}

/// Message counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.failed
    }
}
