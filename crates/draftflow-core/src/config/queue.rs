use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Outbound queue and sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Messages claimed per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Default delivery attempts per message.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// How long a sweep holds a claimed message.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,

    /// Interval between periodic sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl QueueConfig {
    /// Attempt-indexed backoff: 5m, 10m, 20m, ... up to the cap.
    pub fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            claim_lease_secs: default_claim_lease(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base() -> u64 {
    300
}

fn default_backoff_cap() -> u64 {
    6 * 60 * 60
}

fn default_claim_lease() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}
