//! In-memory implementation of every store trait.
//!
//! All state sits behind one mutex and each trait method is a single
//! critical section, which gives the same atomicity as the conditional
//! updates and transactions of the Postgres store. Failure injection hooks
//! let tests exercise the engine's transient-error handling, including a
//! transition that commits but whose acknowledgement is lost.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allowance::{AllowanceAccount, CreditMode};
use crate::audit::AuditEntry;
use crate::error::{DraftflowError, Result};
use crate::outbox::{MessageStatus, QueueStats, QueuedMessage};
use crate::store::{
    AllowanceStore, AuditStore, Charge, FailureOutcome, InstanceStore, OutboxStore,
    TransitionEffects, TransitionOutcome,
};
use crate::workflow::{InstanceUpdate, WorkflowInstance, WorkflowState};

/// A credit applied through [`AllowanceStore::credit`] or a refunding
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRecord {
    pub subject_id: String,
    pub amount: i64,
    pub mode: CreditMode,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, AllowanceAccount>,
    instances: HashMap<Uuid, WorkflowInstance>,
    audit: Vec<AuditEntry>,
    messages: HashMap<Uuid, QueuedMessage>,
    dedupe: HashMap<String, Uuid>,
    credits: Vec<CreditRecord>,
    transient_failures: u32,
    lost_acks: u32,
    audit_down: bool,
    outbox_down: bool,
}

impl State {
    fn take_injected_failure(&mut self) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(DraftflowError::TransientStore(
                "injected transient failure".into(),
            ));
        }
        Ok(())
    }

    fn take_lost_ack(&mut self) -> Result<()> {
        if self.lost_acks > 0 {
            self.lost_acks -= 1;
            return Err(DraftflowError::TransientStore(
                "connection lost after commit".into(),
            ));
        }
        Ok(())
    }

    fn deduct(
        &mut self,
        subject_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Option<AllowanceAccount> {
        let account = self.accounts.get_mut(subject_id)?;
        if account.unlimited {
            return Some(account.clone());
        }
        if account.balance < amount {
            return None;
        }
        account.balance -= amount;
        account.version += 1;
        account.updated_at = now;
        Some(account.clone())
    }

    fn credit(
        &mut self,
        subject_id: &str,
        amount: i64,
        mode: CreditMode,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>> {
        let Some(account) = self.accounts.get_mut(subject_id) else {
            return Ok(None);
        };
        if !(account.unlimited && mode == CreditMode::Refund) {
            account.balance = account.balance.checked_add(amount).ok_or_else(|| {
                DraftflowError::Validation(format!("balance overflow for subject {}", subject_id))
            })?;
            account.version += 1;
            account.updated_at = now;
        }
        let account = account.clone();
        self.credits.push(CreditRecord {
            subject_id: subject_id.to_string(),
            amount,
            mode,
        });
        Ok(Some(account))
    }

    fn insert_message(&mut self, message: &QueuedMessage) -> Result<(Uuid, bool)> {
        if self.outbox_down {
            return Err(DraftflowError::TransientStore("outbox unavailable".into()));
        }
        if let Some(key) = &message.dedupe_key {
            if let Some(existing) = self.dedupe.get(key) {
                return Ok((*existing, false));
            }
            self.dedupe.insert(key.clone(), message.id);
        }
        self.messages.insert(message.id, message.clone());
        Ok((message.id, true))
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` store calls fail with a transient error.
    pub fn inject_transient_failures(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Make the next `n` transitions commit and then report a transient
    /// error, as when the connection drops before the reply arrives.
    pub fn drop_next_acks(&self, n: u32) {
        self.lock().lost_acks = n;
    }

    /// Make audit appends fail until switched back.
    pub fn set_audit_down(&self, down: bool) {
        self.lock().audit_down = down;
    }

    /// Make message inserts, and transitions that queue a message, fail
    /// until switched back.
    pub fn set_outbox_down(&self, down: bool) {
        self.lock().outbox_down = down;
    }

    /// Every credit applied so far, in order.
    pub fn credits(&self) -> Vec<CreditRecord> {
        self.lock().credits.clone()
    }

    /// Refunds applied to `subject_id`.
    pub fn refunds_for(&self, subject_id: &str) -> Vec<CreditRecord> {
        self.lock()
            .credits
            .iter()
            .filter(|c| c.subject_id == subject_id && c.mode == CreditMode::Refund)
            .cloned()
            .collect()
    }

    /// All messages ordered by creation.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        let mut messages: Vec<_> = self.lock().messages.values().cloned().collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages
    }

    /// Messages addressed to `destination`.
    pub fn messages_to(&self, destination: &str) -> Vec<QueuedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.destination == destination)
            .collect()
    }

    /// All instances ordered by creation.
    pub fn instances(&self) -> Vec<WorkflowInstance> {
        let mut instances: Vec<_> = self.lock().instances.values().cloned().collect();
        instances.sort_by_key(|i| (i.created_at, i.id));
        instances
    }

    /// Overwrite an instance's `updated_at`, to simulate a stalled step.
    pub fn backdate_instance(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(instance) = self.lock().instances.get_mut(&id) {
            instance.updated_at = updated_at;
        }
    }

    /// Force an instance into `state`, to simulate a crash mid-step.
    pub fn force_state(&self, id: Uuid, state: WorkflowState) {
        if let Some(instance) = self.lock().instances.get_mut(&id) {
            instance.state = state;
        }
    }
}

#[async_trait]
impl AllowanceStore for MemoryStore {
    async fn upsert_account(
        &self,
        subject_id: &str,
        initial_balance: i64,
        unlimited: bool,
        now: DateTime<Utc>,
    ) -> Result<AllowanceAccount> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let account = state
            .accounts
            .entry(subject_id.to_string())
            .and_modify(|a| {
                a.balance = a.balance.max(initial_balance);
                a.unlimited = unlimited;
                a.version += 1;
                a.updated_at = now;
            })
            .or_insert_with(|| {
                let mut account = AllowanceAccount::new(subject_id, initial_balance, unlimited);
                account.created_at = now;
                account.updated_at = now;
                account
            });
        Ok(account.clone())
    }

    async fn get_account(&self, subject_id: &str) -> Result<Option<AllowanceAccount>> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        Ok(state.accounts.get(subject_id).cloned())
    }

    async fn deduct(
        &self,
        subject_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        Ok(state.deduct(subject_id, amount, now))
    }

    async fn credit(
        &self,
        subject_id: &str,
        amount: i64,
        mode: CreditMode,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        state.credit(subject_id, amount, mode, now)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        if state.instances.contains_key(&instance.id) {
            return Err(DraftflowError::Database(format!(
                "duplicate workflow instance {}",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        Ok(state.instances.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: WorkflowState,
        update: &InstanceUpdate,
        effects: &TransitionEffects,
    ) -> Result<TransitionOutcome> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let subject_id = match state.instances.get(&id) {
            Some(instance) if instance.state == from => instance.subject_id.clone(),
            _ => return Ok(TransitionOutcome::Conflict),
        };
        if effects.message.is_some() && state.outbox_down {
            return Err(DraftflowError::TransientStore("outbox unavailable".into()));
        }

        // Everything that can refuse runs before the first write.
        let account = match effects.charge {
            Some(Charge::Deduct(amount)) => match state.deduct(&subject_id, amount, update.at) {
                Some(account) => Some(account),
                None => return Ok(TransitionOutcome::Insufficient),
            },
            Some(Charge::Refund(amount)) => {
                state.credit(&subject_id, amount, CreditMode::Refund, update.at)?
            }
            None => None,
        };
        let message_id = match &effects.message {
            Some(message) => Some(state.insert_message(message)?.0),
            None => None,
        };

        let instance = match state.instances.get_mut(&id) {
            Some(instance) => {
                instance.apply(update);
                instance.clone()
            }
            None => return Ok(TransitionOutcome::Conflict),
        };

        state.take_lost_ack()?;
        Ok(TransitionOutcome::Applied {
            instance,
            account,
            message_id,
        })
    }

    async fn claim_stalled(
        &self,
        states: &[WorkflowState],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowInstance>> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let mut stalled: Vec<_> = state
            .instances
            .values()
            .filter(|i| states.contains(&i.state) && i.updated_at <= stale_before)
            .map(|i| (i.updated_at, i.id))
            .collect();
        stalled.sort();

        let limit = usize::try_from(limit).unwrap_or(0);
        let mut claimed = Vec::new();
        for (_, id) in stalled.into_iter().take(limit) {
            if let Some(instance) = state.instances.get_mut(&id) {
                instance.updated_at = now;
                claimed.push(instance.clone());
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        if state.audit_down {
            return Err(DraftflowError::Database("audit log unavailable".into()));
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn list_for_instance(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let mut entries: Vec<_> = state
            .audit
            .iter()
            .filter(|e| e.workflow_instance_id == instance_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn insert_message(&self, message: &QueuedMessage) -> Result<(Uuid, bool)> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        state.insert_message(message)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
        token: Uuid,
    ) -> Result<Vec<QueuedMessage>> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let mut due: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.is_claimable(now))
            .map(|m| (m.next_attempt_at, m.id))
            .collect();
        due.sort();

        let limit = usize::try_from(limit).unwrap_or(0);
        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit) {
            if let Some(message) = state.messages.get_mut(&id) {
                message.claim_token = Some(token);
                message.claimed_until = Some(lease_until);
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_message(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        token: Uuid,
    ) -> Result<Option<QueuedMessage>> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        match state.messages.get_mut(&id) {
            Some(message) if message.is_claimable(now) => {
                message.claim_token = Some(token);
                message.claimed_until = Some(lease_until);
                Ok(Some(message.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_sent(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        match state.messages.get_mut(&id) {
            Some(message) if message.is_claimed_by(token) => {
                message.status = MessageStatus::Sent;
                message.sent_at = Some(now);
                message.claim_token = None;
                message.claimed_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: Uuid,
        token: Uuid,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<bool> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        match state.messages.get_mut(&id) {
            Some(message) if message.is_claimed_by(token) => {
                message.attempts += 1;
                message.last_error = Some(error.to_string());
                message.claim_token = None;
                message.claimed_until = None;
                match outcome {
                    FailureOutcome::Retry { next_attempt_at } => {
                        message.next_attempt_at = next_attempt_at;
                    }
                    FailureOutcome::Terminal => message.status = MessageStatus::Failed,
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        Ok(state.messages.get(&id).cloned())
    }

    async fn count_by_status(&self) -> Result<QueueStats> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        let mut stats = QueueStats::default();
        for message in state.messages.values() {
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn count_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        state.take_injected_failure()?;

        Ok(state
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.next_attempt_at <= now)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::outbox::NewMessage;
    use crate::workflow::WorkflowInput;

    async fn instance_for(store: &MemoryStore, subject_id: &str) -> WorkflowInstance {
        let input = WorkflowInput::GeneralLetter {
            recipient: "Acme".into(),
            topic: "Payment".into(),
            instructions: "Ask politely".into(),
        };
        let instance = WorkflowInstance::new(subject_id, &input).unwrap();
        store.insert_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn test_deduct_never_goes_negative() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 1, false, now).await.unwrap();

        assert!(store.deduct("u", 1, now).await.unwrap().is_some());
        assert!(store.deduct("u", 1, now).await.unwrap().is_none());
        assert_eq!(store.get_account("u").await.unwrap().unwrap().balance, 0);
        assert!(store.deduct("missing", 1, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_never_lowers_balance() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 5, false, now).await.unwrap();
        let account = store.upsert_account("u", 2, false, now).await.unwrap();
        assert_eq!(account.balance, 5);
    }

    #[tokio::test]
    async fn test_unlimited_refund_is_noop() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("admin", 0, true, now).await.unwrap();
        let after = store
            .credit("admin", 1, CreditMode::Refund, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.balance, 0);
        assert_eq!(after.version, 0);
    }

    #[tokio::test]
    async fn test_dedupe_key_returns_existing_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = NewMessage::new("a", serde_json::json!({}), 3)
            .with_dedupe_key("k")
            .into_record(now);
        let second = NewMessage::new("a", serde_json::json!({}), 3)
            .with_dedupe_key("k")
            .into_record(now);

        let (id1, inserted1) = store.insert_message(&first).await.unwrap();
        let (id2, inserted2) = store.insert_message(&second).await.unwrap();
        assert!(inserted1);
        assert!(!inserted2);
        assert_eq!(id1, id2);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let msg = NewMessage::new("a", serde_json::json!({}), 3).into_record(now);
        store.insert_message(&msg).await.unwrap();

        let lease = now + Duration::seconds(60);
        let first = store.claim_due(now, lease, 10, Uuid::new_v4()).await.unwrap();
        let second = store.claim_due(now, lease, 10, Uuid::new_v4()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        let later = store
            .claim_due(lease, lease + Duration::seconds(60), 10, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_token_cannot_complete() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let msg = NewMessage::new("a", serde_json::json!({}), 3).into_record(now);
        store.insert_message(&msg).await.unwrap();

        let token = Uuid::new_v4();
        store
            .claim_message(msg.id, now, now + Duration::seconds(5), token)
            .await
            .unwrap();
        assert!(!store.mark_sent(msg.id, Uuid::new_v4(), now).await.unwrap());
        assert!(store.mark_sent(msg.id, token, now).await.unwrap());
        assert!(!store.mark_sent(msg.id, token, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_transient_failures(2);
        assert!(store.get_account("u").await.unwrap_err().is_transient());
        assert!(store.get_account("u").await.is_err());
        assert!(store.get_account("u").await.is_ok());
    }

    #[tokio::test]
    async fn test_credit_overflow_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", i64::MAX - 1, false, now).await.unwrap();

        let result = store.credit("u", 5, CreditMode::Grant, now).await;
        assert!(matches!(result, Err(DraftflowError::Validation(_))));
        let account = store.get_account("u").await.unwrap().unwrap();
        assert_eq!(account.balance, i64::MAX - 1);
        assert!(store.credits().is_empty());
    }

    #[tokio::test]
    async fn test_uncovered_charge_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 0, false, now).await.unwrap();
        let instance = instance_for(&store, "u").await;

        let outcome = store
            .transition(
                instance.id,
                WorkflowState::Created,
                &InstanceUpdate::to(WorkflowState::AllowanceChecked),
                &TransitionEffects::charge(Charge::Deduct(1)),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TransitionOutcome::Insufficient));
        let stored = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Created);
    }

    #[tokio::test]
    async fn test_conflicting_transition_skips_charge_and_message() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 3, false, now).await.unwrap();
        let instance = instance_for(&store, "u").await;

        let effects = TransitionEffects {
            charge: Some(Charge::Refund(1)),
            message: Some(NewMessage::new("u", serde_json::json!({}), 3).into_record(now)),
        };
        let outcome = store
            .transition(
                instance.id,
                WorkflowState::Generating,
                &InstanceUpdate::to(WorkflowState::Failed),
                &effects,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TransitionOutcome::Conflict));
        assert_eq!(store.get_account("u").await.unwrap().unwrap().balance, 3);
        assert!(store.credits().is_empty());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_outbox_outage_blocks_the_whole_transition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 1, false, now).await.unwrap();
        let instance = instance_for(&store, "u").await;

        store.set_outbox_down(true);
        let effects = TransitionEffects {
            charge: Some(Charge::Deduct(1)),
            message: Some(NewMessage::new("u", serde_json::json!({}), 3).into_record(now)),
        };
        let result = store
            .transition(
                instance.id,
                WorkflowState::Created,
                &InstanceUpdate::to(WorkflowState::AllowanceChecked),
                &effects,
            )
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(store.get_account("u").await.unwrap().unwrap().balance, 1);
        let stored = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Created);
    }

    #[tokio::test]
    async fn test_lost_ack_still_commits() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_account("u", 1, false, now).await.unwrap();
        let instance = instance_for(&store, "u").await;

        store.drop_next_acks(1);
        let update = InstanceUpdate::to(WorkflowState::AllowanceChecked);
        let effects = TransitionEffects::charge(Charge::Deduct(1));
        let first = store
            .transition(instance.id, WorkflowState::Created, &update, &effects)
            .await;
        assert!(first.unwrap_err().is_transient());

        // A retry sees the committed state and charges nothing more.
        let retry = store
            .transition(instance.id, WorkflowState::Created, &update, &effects)
            .await
            .unwrap();
        assert!(matches!(retry, TransitionOutcome::Conflict));
        assert_eq!(store.get_account("u").await.unwrap().unwrap().balance, 0);
    }
}
