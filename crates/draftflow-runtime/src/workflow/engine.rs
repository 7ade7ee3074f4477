use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use draftflow_core::allowance::AllowanceAccount;
use draftflow_core::audit::{AuditAction, AuditEntry};
use draftflow_core::config::DraftflowConfig;
use draftflow_core::error::{DraftflowError, Result};
use draftflow_core::outbox::{NewMessage, NotificationSender, QueuedMessage};
use draftflow_core::retry::{self, RetryError, RetryPolicy};
use draftflow_core::store::{Charge, InstanceStore, Store, TransitionEffects, TransitionOutcome};
use draftflow_core::workflow::{
    Decision, DraftGenerator, DraftResult, GenerationError, InstanceUpdate, WorkflowInput,
    WorkflowInstance, WorkflowKind, WorkflowState,
};

use crate::audit::AuditLog;
use crate::ledger::AllowanceLedger;
use crate::outbox::OutboundQueue;
use crate::store_retry::with_store_retry;

/// Reason recorded when a subject has no allowance left.
pub const NO_ALLOWANCE: &str = "no allowance";

/// Reason recorded when recovery finds an instance whose charge never
/// committed.
pub const INTERRUPTED: &str = "interrupted before allowance check";

/// States a crashed process can leave behind mid-step.
const RECOVERABLE_STATES: [WorkflowState; 4] = [
    WorkflowState::Created,
    WorkflowState::AllowanceChecked,
    WorkflowState::Generating,
    WorkflowState::Approved,
];

/// Snapshot returned by [`WorkflowEngine::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub subject_id: String,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    pub error_reason: Option<String>,
    pub result: Option<DraftResult>,
    pub reviewer_id: Option<String>,
    pub history: Vec<AuditEntry>,
}

/// Outcome of one [`WorkflowEngine::recover_stalled`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Instances claimed for recovery.
    pub claimed: u64,
    /// Instances driven to a non-failed state.
    pub advanced: u64,
    /// Instances that ended up failed.
    pub failed: u64,
    /// Instances whose recovery hit an error; retried on a later pass.
    pub errors: u64,
}

/// Durable generation-and-review state machine.
///
/// Every step is a conditional update on the stored instance, so the
/// engine holds no in-process state between calls: a suspended instance
/// is just a row in `pending_review` or `under_review`, and a signal is a
/// fresh invocation that reads it back. Concurrent signals for the same
/// instance race on the conditional update and exactly one wins.
///
/// The allowance charge, its refund and every notification commit in the
/// same store transaction as the transition that causes them. A crash
/// therefore leaves either both or neither, and a retried step whose first
/// attempt committed loses the race against itself instead of charging or
/// notifying twice.
pub struct WorkflowEngine {
    instances: Arc<dyn InstanceStore>,
    ledger: AllowanceLedger,
    audit: AuditLog,
    queue: Arc<OutboundQueue>,
    generator: Arc<dyn DraftGenerator>,
    generation_policy: RetryPolicy,
    store_retry: RetryPolicy,
    review_destination: String,
    notification_max_attempts: u32,
}

impl WorkflowEngine {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        generator: Arc<dyn DraftGenerator>,
        sender: Arc<dyn NotificationSender>,
        config: &DraftflowConfig,
    ) -> Self {
        let store_retry = config.engine.store_retry_policy();
        let queue = Arc::new(OutboundQueue::new(
            store.clone(),
            sender,
            config.queue.clone(),
        ));

        Self {
            instances: store.clone(),
            ledger: AllowanceLedger::new(store.clone(), store_retry.clone()),
            audit: AuditLog::new(store),
            queue,
            generator,
            generation_policy: config.generation.retry_policy(),
            store_retry,
            review_destination: config.engine.review_destination.clone(),
            notification_max_attempts: config.engine.notification_max_attempts,
        }
    }

    pub fn ledger(&self) -> &AllowanceLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Start an instance and run it up to the review boundary.
    ///
    /// Returns the instance id once the draft is waiting for review, or
    /// once generation has failed and the allowance has been refunded.
    /// Lack of allowance is returned as `InsufficientAllowance` carrying
    /// the id of the (failed) instance.
    pub async fn start_workflow(&self, subject_id: &str, input: WorkflowInput) -> Result<Uuid> {
        input.validate()?;

        let instance = WorkflowInstance::new(subject_id, &input)?;
        let id = instance.id;
        with_store_retry(&self.store_retry, |_| self.instances.insert_instance(&instance)).await?;
        self.audit
            .record(AuditEntry::new(id, AuditAction::Created, None, WorkflowState::Created))
            .await;

        tracing::info!(
            instance_id = %id,
            subject_id = %subject_id,
            kind = %instance.kind,
            "Workflow started"
        );

        let entry = transition_entry(&instance, AuditAction::AllowanceChecked, WorkflowState::AllowanceChecked);
        let charged = match self
            .advance(
                &instance,
                InstanceUpdate::to(WorkflowState::AllowanceChecked),
                TransitionEffects::charge(Charge::Deduct(1)),
                entry,
            )
            .await
        {
            Ok(TransitionOutcome::Applied { instance, .. }) => instance,
            Ok(TransitionOutcome::Insufficient) => {
                if let Err(e) = self.fail_uncharged(&instance, NO_ALLOWANCE).await {
                    tracing::warn!(instance_id = %id, error = %e, "Failed to mark instance failed");
                }
                return Err(DraftflowError::InsufficientAllowance {
                    subject_id: subject_id.to_string(),
                    instance_id: Some(id),
                });
            }
            // A retried charge whose first attempt committed.
            Ok(TransitionOutcome::Conflict) => {
                let current = self.load(id).await?;
                match current.state {
                    WorkflowState::AllowanceChecked => current,
                    WorkflowState::Created => {
                        return Err(invalid(id, WorkflowState::Created, current.state))
                    }
                    _ => return Ok(id),
                }
            }
            Err(e) => {
                // Lands only if the charge did not commit.
                let reason = format!("allowance check failed: {}", e);
                if let Err(mark_err) = self.fail_uncharged(&instance, &reason).await {
                    tracing::warn!(instance_id = %id, error = %mark_err, "Failed to mark instance failed");
                }
                return Err(e);
            }
        };

        self.run_generation(charged).await?;
        Ok(id)
    }

    /// Assign a reviewer: `pending_review → under_review`.
    ///
    /// Repeating the call with the same reviewer, or calling it on a
    /// terminal instance, is a no-op that reports the current state.
    pub async fn signal_review_start(
        &self,
        instance_id: Uuid,
        reviewer_id: &str,
    ) -> Result<WorkflowState> {
        if reviewer_id.trim().is_empty() {
            return Err(DraftflowError::Validation("reviewer_id is required".into()));
        }

        let instance = self.load(instance_id).await?;
        if let Some(state) = settled_review_start(&instance, reviewer_id) {
            return Ok(state);
        }
        if instance.state != WorkflowState::PendingReview {
            return Err(invalid(instance_id, WorkflowState::PendingReview, instance.state));
        }

        let update = InstanceUpdate::to(WorkflowState::UnderReview)
            .with_reviewer(Some(reviewer_id.to_string()), Utc::now());
        let entry = transition_entry(&instance, AuditAction::ReviewStarted, WorkflowState::UnderReview)
            .with_actor(reviewer_id);

        match self
            .advance(&instance, update, TransitionEffects::none(), entry)
            .await?
            .into_instance()
        {
            Some(_) => {
                tracing::info!(
                    instance_id = %instance_id,
                    reviewer_id = %reviewer_id,
                    "Review started"
                );
                Ok(WorkflowState::UnderReview)
            }
            None => {
                let current = self.load(instance_id).await?;
                settled_review_start(&current, reviewer_id).ok_or_else(|| invalid(
                    instance_id,
                    WorkflowState::PendingReview,
                    current.state,
                ))
            }
        }
    }

    /// Resume a suspended instance with the reviewer's decision.
    ///
    /// Accepted only from `under_review`. A decision for an instance that
    /// already reached a terminal state is a no-op reporting that state,
    /// even when the repeated decision itself would not validate.
    pub async fn signal_decision(
        &self,
        instance_id: Uuid,
        decision: Decision,
    ) -> Result<WorkflowState> {
        let instance = self.load(instance_id).await?;
        match instance.state {
            state if state.is_terminal() => {
                tracing::info!(
                    instance_id = %instance_id,
                    state = %state,
                    "Decision for settled instance ignored"
                );
                return Ok(state);
            }
            // A previous call was cut off between approval and completion.
            WorkflowState::Approved => return self.complete(instance).await,
            WorkflowState::UnderReview => {}
            other => return Err(invalid(instance_id, WorkflowState::UnderReview, other)),
        }

        decision.validate()?;
        if decision.approved {
            self.approve(instance, decision).await
        } else {
            self.reject(instance, decision).await
        }
    }

    /// Current state plus full audit history.
    pub async fn get_status(&self, instance_id: Uuid) -> Result<StatusReport> {
        let instance = self.load(instance_id).await?;
        let history = self.audit.history(instance_id).await?;

        Ok(StatusReport {
            instance_id,
            result: instance.draft_result(),
            subject_id: instance.subject_id,
            kind: instance.kind,
            state: instance.state,
            error_reason: instance.error_reason,
            reviewer_id: instance.reviewer_id,
            history,
        })
    }

    /// Drive forward instances left mid-step by a crashed process.
    ///
    /// Instances in `created`, `allowance_checked`, `generating` or
    /// `approved` not updated for `stale_after` are claimed and resumed:
    /// `created` ones hold no charge and fail, charged ones re-run
    /// generation (refunding on failure), approved ones are completed.
    pub async fn recover_stalled(&self, stale_after: Duration, limit: i64) -> Result<RecoveryStats> {
        let now = Utc::now();
        let stale_for = chrono::Duration::from_std(stale_after)
            .map_err(|e| DraftflowError::Config(format!("Duration out of range: {}", e)))?;
        let stale_before = now - stale_for;

        let claimed = with_store_retry(&self.store_retry, |_| {
            self.instances
                .claim_stalled(&RECOVERABLE_STATES, stale_before, now, limit)
        })
        .await?;

        let mut stats = RecoveryStats {
            claimed: claimed.len() as u64,
            ..Default::default()
        };

        for instance in claimed {
            let id = instance.id;
            let from = instance.state;
            tracing::info!(instance_id = %id, state = %from, "Recovering stalled instance");

            let outcome = match from {
                WorkflowState::Created => self.fail_uncharged(&instance, INTERRUPTED).await,
                WorkflowState::AllowanceChecked | WorkflowState::Generating => {
                    self.run_generation(instance).await
                }
                WorkflowState::Approved => self.complete(instance).await,
                _ => continue,
            };

            match outcome {
                Ok(WorkflowState::Failed) => stats.failed += 1,
                Ok(_) => stats.advanced += 1,
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(instance_id = %id, state = %from, error = %e, "Recovery failed");
                }
            }
        }

        Ok(stats)
    }

    /// `allowance_checked → generating → pending_review`, or `failed` with
    /// a refund when generation gives up.
    async fn run_generation(&self, instance: WorkflowInstance) -> Result<WorkflowState> {
        let instance = if instance.state == WorkflowState::AllowanceChecked {
            let entry =
                transition_entry(&instance, AuditAction::GenerationStarted, WorkflowState::Generating);
            match self
                .advance(
                    &instance,
                    InstanceUpdate::to(WorkflowState::Generating),
                    TransitionEffects::none(),
                    entry,
                )
                .await?
                .into_instance()
            {
                Some(generating) => generating,
                None => return self.current_state(instance.id).await,
            }
        } else {
            instance
        };

        let input = match instance.input() {
            Ok(input) => input,
            Err(e) => {
                return self
                    .fail_generation(&instance, format!("invalid stored input: {}", e))
                    .await
            }
        };

        let id = instance.id;
        let generated = retry::run(&self.generation_policy, |attempt| {
            tracing::debug!(instance_id = %id, attempt, "Generating draft");
            self.generator.generate(&input)
        })
        .await;

        match generated {
            Ok(text) => self.store_draft(instance, text).await,
            Err(e) => self.fail_generation(&instance, generation_failure(&e)).await,
        }
    }

    /// `generating → pending_review`, queuing the review request with it.
    async fn store_draft(&self, instance: WorkflowInstance, text: String) -> Result<WorkflowState> {
        let result = DraftResult::draft(text).to_value()?;
        let entry = transition_entry(&instance, AuditAction::DraftReady, WorkflowState::PendingReview);
        let request = self.notification(
            self.review_destination.clone(),
            json!({
                "event": "review_requested",
                "instance_id": instance.id,
                "subject_id": instance.subject_id,
                "kind": instance.kind,
            }),
            format!("{}:review_request", instance.id),
        );

        let Some(pending) = self
            .advance(
                &instance,
                InstanceUpdate::to(WorkflowState::PendingReview).with_result(result),
                TransitionEffects::message(request),
                entry,
            )
            .await?
            .into_instance()
        else {
            return self.current_state(instance.id).await;
        };

        tracing::info!(instance_id = %pending.id, "Draft ready for review");
        Ok(WorkflowState::PendingReview)
    }

    /// `generating → failed` with the refund in the same commit, so a
    /// charge is given back at most once per instance.
    async fn fail_generation(&self, instance: &WorkflowInstance, reason: String) -> Result<WorkflowState> {
        let entry = transition_entry(instance, AuditAction::Failed, WorkflowState::Failed)
            .with_notes(reason.clone());
        let update = InstanceUpdate::to(WorkflowState::Failed).with_error_reason(reason.clone());

        let outcome = self
            .advance(instance, update, TransitionEffects::charge(Charge::Refund(1)), entry)
            .await?;
        let TransitionOutcome::Applied { account, .. } = outcome else {
            return self.current_state(instance.id).await;
        };

        tracing::warn!(instance_id = %instance.id, reason = %reason, "Generation failed");
        match account {
            Some(account) => {
                tracing::info!(
                    instance_id = %instance.id,
                    subject_id = %instance.subject_id,
                    remaining = %account.remaining(),
                    "Allowance refunded"
                );
            }
            None => {
                tracing::error!(
                    instance_id = %instance.id,
                    subject_id = %instance.subject_id,
                    "No allowance account to refund"
                );
                self.audit
                    .record(
                        AuditEntry::new(
                            instance.id,
                            AuditAction::RefundFailed,
                            Some(WorkflowState::Failed),
                            WorkflowState::Failed,
                        )
                        .with_notes("allowance account not found"),
                    )
                    .await;
            }
        }
        Ok(WorkflowState::Failed)
    }

    /// `created → failed` for an instance that holds no charge.
    async fn fail_uncharged(&self, instance: &WorkflowInstance, reason: &str) -> Result<WorkflowState> {
        let entry = transition_entry(instance, AuditAction::Failed, WorkflowState::Failed)
            .with_notes(reason);
        let update = InstanceUpdate::to(WorkflowState::Failed).with_error_reason(reason);

        match self
            .advance(instance, update, TransitionEffects::none(), entry)
            .await?
            .into_instance()
        {
            Some(_) => {
                tracing::info!(instance_id = %instance.id, reason = %reason, "Workflow failed");
                Ok(WorkflowState::Failed)
            }
            None => self.current_state(instance.id).await,
        }
    }

    async fn approve(&self, instance: WorkflowInstance, decision: Decision) -> Result<WorkflowState> {
        let draft = instance.draft_result().ok_or_else(|| {
            DraftflowError::Internal(format!("instance {} has no draft", instance.id))
        })?;
        let result = DraftResult {
            final_content: Some(decision.final_content.unwrap_or_else(|| draft.draft.clone())),
            decided_by: Some(decision.actor_id.clone()),
            ..draft
        };

        let entry = transition_entry(&instance, AuditAction::Approve, WorkflowState::Approved)
            .with_actor(decision.actor_id.as_str());
        let update = InstanceUpdate::to(WorkflowState::Approved).with_result(result.to_value()?);

        match self
            .advance(&instance, update, TransitionEffects::none(), entry)
            .await?
            .into_instance()
        {
            Some(approved) => {
                tracing::info!(
                    instance_id = %approved.id,
                    actor_id = %decision.actor_id,
                    "Draft approved"
                );
                self.complete(approved).await
            }
            None => self.settle_decision_race(instance.id).await,
        }
    }

    /// `under_review → rejected`, queuing the subject's notice with it.
    async fn reject(&self, instance: WorkflowInstance, decision: Decision) -> Result<WorkflowState> {
        let reason = decision.reason.unwrap_or_default();

        let entry = transition_entry(&instance, AuditAction::Reject, WorkflowState::Rejected)
            .with_actor(decision.actor_id.as_str())
            .with_notes(reason.clone());
        let update = InstanceUpdate::to(WorkflowState::Rejected).with_error_reason(reason.clone());
        let notice = self.notification(
            instance.subject_id.clone(),
            json!({
                "event": "decision",
                "instance_id": instance.id,
                "approved": false,
                "reason": reason,
            }),
            format!("{}:decision", instance.id),
        );

        let Some(rejected) = self
            .advance(&instance, update, TransitionEffects::message(notice), entry)
            .await?
            .into_instance()
        else {
            return self.settle_decision_race(instance.id).await;
        };

        tracing::info!(
            instance_id = %rejected.id,
            actor_id = %decision.actor_id,
            "Draft rejected"
        );
        Ok(WorkflowState::Rejected)
    }

    /// `approved → completed`, queuing the subject's notice with it.
    async fn complete(&self, approved: WorkflowInstance) -> Result<WorkflowState> {
        let final_content = approved.draft_result().and_then(|r| r.final_content);
        let notice = self.notification(
            approved.subject_id.clone(),
            json!({
                "event": "decision",
                "instance_id": approved.id,
                "approved": true,
                "final_content": final_content,
            }),
            format!("{}:decision", approved.id),
        );

        let entry = transition_entry(&approved, AuditAction::Completed, WorkflowState::Completed);
        match self
            .advance(
                &approved,
                InstanceUpdate::to(WorkflowState::Completed),
                TransitionEffects::message(notice),
                entry,
            )
            .await?
            .into_instance()
        {
            Some(_) => {
                tracing::info!(instance_id = %approved.id, "Workflow completed");
                Ok(WorkflowState::Completed)
            }
            None => self.current_state(approved.id).await,
        }
    }

    /// Conditional transition committed with `effects`, plus its audit
    /// entry. Only edges of the state machine are accepted.
    async fn advance(
        &self,
        instance: &WorkflowInstance,
        update: InstanceUpdate,
        effects: TransitionEffects,
        entry: AuditEntry,
    ) -> Result<TransitionOutcome> {
        let from = instance.state;
        if !from.can_transition_to(update.to) {
            return Err(DraftflowError::Internal(format!(
                "illegal transition {} -> {} for instance {}",
                from, update.to, instance.id
            )));
        }

        let outcome = with_store_retry(&self.store_retry, |_| {
            self.instances.transition(instance.id, from, &update, &effects)
        })
        .await?;

        match &outcome {
            TransitionOutcome::Applied {
                account,
                message_id,
                ..
            } => {
                tracing::debug!(
                    instance_id = %instance.id,
                    from = %from,
                    to = %update.to,
                    "Instance transitioned"
                );
                self.audit
                    .record(with_effects(entry, account.as_ref(), *message_id))
                    .await;
            }
            TransitionOutcome::Conflict => {
                tracing::debug!(
                    instance_id = %instance.id,
                    from = %from,
                    to = %update.to,
                    "Transition lost to a concurrent writer"
                );
            }
            TransitionOutcome::Insufficient => {
                tracing::debug!(
                    instance_id = %instance.id,
                    subject_id = %instance.subject_id,
                    "Allowance does not cover the charge"
                );
            }
        }
        Ok(outcome)
    }

    fn notification(
        &self,
        destination: impl Into<String>,
        payload: serde_json::Value,
        dedupe_key: String,
    ) -> QueuedMessage {
        NewMessage::new(destination, payload, self.notification_max_attempts)
            .with_dedupe_key(dedupe_key)
            .into_record(Utc::now())
    }

    async fn load(&self, instance_id: Uuid) -> Result<WorkflowInstance> {
        with_store_retry(&self.store_retry, |_| self.instances.get_instance(instance_id))
            .await?
            .ok_or_else(|| DraftflowError::NotFound(format!("workflow instance {}", instance_id)))
    }

    async fn current_state(&self, instance_id: Uuid) -> Result<WorkflowState> {
        Ok(self.load(instance_id).await?.state)
    }

    /// A competing decision landed first. Settled outcomes are reported,
    /// anything else is a conflict.
    async fn settle_decision_race(&self, instance_id: Uuid) -> Result<WorkflowState> {
        let state = self.current_state(instance_id).await?;
        if state.is_terminal() || state == WorkflowState::Approved {
            return Ok(state);
        }
        Err(invalid(instance_id, WorkflowState::UnderReview, state))
    }

    async fn conflict(&self, instance_id: Uuid, expected: WorkflowState) -> DraftflowError {
        match self.current_state(instance_id).await {
            Ok(actual) => invalid(instance_id, expected, actual),
            Err(e) => e,
        }
    }
}

fn transition_entry(instance: &WorkflowInstance, action: AuditAction, to: WorkflowState) -> AuditEntry {
    AuditEntry::new(instance.id, action, Some(instance.state), to)
}

/// Record the committed charge and message on the entry.
fn with_effects(
    entry: AuditEntry,
    account: Option<&AllowanceAccount>,
    message_id: Option<Uuid>,
) -> AuditEntry {
    let mut metadata = serde_json::Map::new();
    if let Some(account) = account {
        metadata.insert("remaining".into(), json!(account.remaining().to_string()));
    }
    if let Some(message_id) = message_id {
        metadata.insert("message_id".into(), json!(message_id));
    }
    if metadata.is_empty() {
        entry
    } else {
        entry.with_metadata(serde_json::Value::Object(metadata))
    }
}

fn invalid(instance_id: Uuid, expected: WorkflowState, actual: WorkflowState) -> DraftflowError {
    DraftflowError::InvalidTransition {
        instance_id,
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

/// `Some(state)` when a review-start signal needs no work.
fn settled_review_start(instance: &WorkflowInstance, reviewer_id: &str) -> Option<WorkflowState> {
    match instance.state {
        WorkflowState::PendingReview => None,
        WorkflowState::UnderReview if instance.reviewer_id.as_deref() == Some(reviewer_id) => {
            Some(WorkflowState::UnderReview)
        }
        state if state.is_terminal() => Some(state),
        _ => None,
    }
}

fn generation_failure(error: &RetryError<GenerationError>) -> String {
    match error {
        RetryError::Exhausted {
            attempts,
            last_error,
        } => format!("generation failed after {} attempts: {}", attempts, last_error),
        RetryError::Aborted { error, .. } => format!("generation failed: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use draftflow_core::assert_err_variant;
    use draftflow_core::testing::{MemoryStore, RecordingSender, ScriptedGenerator};

    use super::*;

    #[tokio::test]
    async fn test_advance_refuses_edges_outside_the_state_machine() {
        let store = Arc::new(MemoryStore::new());
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(ScriptedGenerator::succeeding("Dear Acme")),
            Arc::new(RecordingSender::new()),
            &DraftflowConfig::default_with_database_url("postgres://localhost/unused"),
        );
        let input = WorkflowInput::GeneralLetter {
            recipient: "Acme".into(),
            topic: "Payment".into(),
            instructions: "Ask politely".into(),
        };
        let instance = WorkflowInstance::new("user-1", &input).unwrap();
        store.insert_instance(&instance).await.unwrap();

        let entry = transition_entry(&instance, AuditAction::Completed, WorkflowState::Completed);
        let result = engine
            .advance(
                &instance,
                InstanceUpdate::to(WorkflowState::Completed),
                TransitionEffects::none(),
                entry,
            )
            .await;

        assert_err_variant!(result, DraftflowError::Internal(_));
        let stored = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Created);
        assert!(engine.audit().history(instance.id).await.unwrap().is_empty());
    }
}
