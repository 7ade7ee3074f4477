use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Destination for review-request notifications.
    #[serde(default = "default_review_destination")]
    pub review_destination: String,

    /// Delivery attempts for notifications the engine enqueues.
    #[serde(default = "default_notification_max_attempts")]
    pub notification_max_attempts: u32,

    /// Attempts for each store call before a transient error surfaces.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    #[serde(default = "default_store_retry_base")]
    pub store_retry_base_ms: u64,

    /// Instances mid-step for longer than this are picked up by recovery.
    #[serde(default = "default_stalled_after")]
    pub stalled_after_secs: u64,

    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
}

impl EngineConfig {
    /// Small bounded retry for transient store errors.
    pub fn store_retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.store_retry_base_ms);
        RetryPolicy::exponential(self.store_retry_attempts, base, base.saturating_mul(8))
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            review_destination: default_review_destination(),
            notification_max_attempts: default_notification_max_attempts(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_base_ms: default_store_retry_base(),
            stalled_after_secs: default_stalled_after(),
            recovery_interval_secs: default_recovery_interval(),
        }
    }
}

fn default_review_destination() -> String {
    "reviewers".to_string()
}

fn default_notification_max_attempts() -> u32 {
    5
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_base() -> u64 {
    50
}

fn default_stalled_after() -> u64 {
    15 * 60
}

fn default_recovery_interval() -> u64 {
    60
}

/// Draft generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Endpoint of the HTTP generator.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_generation_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_generation_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_generation_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_generation_timeout(),
            max_attempts: default_generation_attempts(),
            base_delay_ms: default_generation_base_delay(),
            max_delay_ms: default_generation_max_delay(),
            jitter: true,
        }
    }
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_generation_attempts() -> u32 {
    3
}

fn default_generation_base_delay() -> u64 {
    500
}

fn default_generation_max_delay() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Notification transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Webhook receiving `{destination, payload}` posts.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_notifier_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_policy() {
        let policy = GenerationConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.jitter);
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_store_retry_policy_is_small() {
        let policy = EngineConfig::default().store_retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_millis(400));
    }
}
