//! Persistence seams.
//!
//! Every method is one atomic operation against the backing store. Callers
//! coordinate through these conditional updates, never through in-process
//! locks, since engine handlers and sweeps may run in separate processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allowance::{AllowanceAccount, CreditMode};
use crate::audit::AuditEntry;
use crate::error::Result;
use crate::outbox::{QueueStats, QueuedMessage};
use crate::workflow::{InstanceUpdate, WorkflowInstance, WorkflowState};

/// Per-subject allowance accounts.
#[async_trait]
pub trait AllowanceStore: Send + Sync {
    /// Create the account, or raise an existing balance to at least
    /// `initial_balance`. `unlimited` is overwritten.
    async fn upsert_account(
        &self,
        subject_id: &str,
        initial_balance: i64,
        unlimited: bool,
        now: DateTime<Utc>,
    ) -> Result<AllowanceAccount>;

    async fn get_account(&self, subject_id: &str) -> Result<Option<AllowanceAccount>>;

    /// Deduct `amount` if the balance covers it. Unlimited accounts succeed
    /// without change. `None` when the balance is short or the account does
    /// not exist.
    async fn deduct(
        &self,
        subject_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>>;

    /// Add `amount`. `None` when the account does not exist.
    async fn credit(
        &self,
        subject_id: &str,
        amount: i64,
        mode: CreditMode,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>>;
}

/// Allowance movement committed with a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// Deduct if the balance covers it. Unlimited accounts are untouched.
    Deduct(i64),
    /// Give a deduction back. Unlimited accounts are untouched.
    Refund(i64),
}

/// Side effects that commit or roll back with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionEffects {
    pub charge: Option<Charge>,
    /// Inserted under the outbox dedupe rules.
    pub message: Option<QueuedMessage>,
}

impl TransitionEffects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn charge(charge: Charge) -> Self {
        Self {
            charge: Some(charge),
            message: None,
        }
    }

    pub fn message(message: QueuedMessage) -> Self {
        Self {
            charge: None,
            message: Some(message),
        }
    }
}

/// Result of [`InstanceStore::transition`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        instance: WorkflowInstance,
        /// Account after the charge. `None` without a charge, or when a
        /// refund found no account.
        account: Option<AllowanceAccount>,
        /// Id of the queued message, or of the existing one it deduped to.
        message_id: Option<Uuid>,
    },
    /// The instance was not in `from`.
    Conflict,
    /// The deduction was not covered, or the subject has no account.
    Insufficient,
}

impl TransitionOutcome {
    /// The updated instance when the transition was applied.
    pub fn into_instance(self) -> Option<WorkflowInstance> {
        match self {
            Self::Applied { instance, .. } => Some(instance),
            Self::Conflict | Self::Insufficient => None,
        }
    }
}

/// Workflow instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>>;

    /// Apply `update` only if the instance is still in `from`, together
    /// with `effects`, as one atomic unit. The charge is applied to the
    /// instance's subject. When the outcome is not `Applied` nothing was
    /// written.
    async fn transition(
        &self,
        id: Uuid,
        from: WorkflowState,
        update: &InstanceUpdate,
        effects: &TransitionEffects,
    ) -> Result<TransitionOutcome>;

    /// Claim up to `limit` instances in `states` not updated since
    /// `stale_before` by bumping their `updated_at` to `now`. A claimed
    /// instance is invisible to other callers until it goes stale again.
    async fn claim_stalled(
        &self,
        states: &[WorkflowState],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowInstance>>;
}

/// Audit history.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Entries for one instance ordered by `(created_at, id)`.
    async fn list_for_instance(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>>;
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Stay pending until `next_attempt_at`.
    Retry { next_attempt_at: DateTime<Utc> },
    /// Mark failed. `next_attempt_at` is left as is.
    Terminal,
}

/// Outbound message queue.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a message. With a dedupe key that already exists, nothing is
    /// inserted and the existing id is returned with `false`.
    async fn insert_message(&self, message: &QueuedMessage) -> Result<(Uuid, bool)>;

    /// Claim up to `limit` due messages ordered by `next_attempt_at`,
    /// setting `claim_token = token` and `claimed_until = lease_until`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
        token: Uuid,
    ) -> Result<Vec<QueuedMessage>>;

    /// Claim one specific message if it is claimable.
    async fn claim_message(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        token: Uuid,
    ) -> Result<Option<QueuedMessage>>;

    /// Mark sent. `false` when `token` no longer holds the claim.
    async fn mark_sent(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Count one failed attempt and release the claim. `false` when `token`
    /// no longer holds the claim.
    async fn record_failure(
        &self,
        id: Uuid,
        token: Uuid,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<bool>;

    async fn get_message(&self, id: Uuid) -> Result<Option<QueuedMessage>>;

    async fn count_by_status(&self) -> Result<QueueStats>;

    /// Pending messages due at `now`, claimed or not.
    async fn count_due(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Everything the engine needs from one backend.
pub trait Store: AllowanceStore + InstanceStore + AuditStore + OutboxStore {}

impl<T> Store for T where T: AllowanceStore + InstanceStore + AuditStore + OutboxStore {}
