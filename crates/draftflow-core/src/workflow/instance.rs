use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::input::{WorkflowInput, WorkflowKind};
use super::state::WorkflowState;
use crate::error::Result;

/// One execution of the generation-and-review pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique instance ID.
    pub id: Uuid,
    /// Owner of the instance (and of the allowance it consumed).
    pub subject_id: String,
    /// Pipeline type.
    pub kind: WorkflowKind,
    /// Current state. Only the engine changes it.
    pub state: WorkflowState,
    /// Validated input as JSON.
    pub payload: serde_json::Value,
    /// Output as JSON, see [`DraftResult`].
    pub result: Option<serde_json::Value>,
    /// Human-readable failure or rejection reason.
    pub error_reason: Option<String>,
    /// Reviewer assigned by the review-start signal.
    pub reviewer_id: Option<String>,
    /// When the review started.
    pub review_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a new instance in the `created` state.
    pub fn new(subject_id: impl Into<String>, input: &WorkflowInput) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            subject_id: subject_id.into(),
            kind: input.kind(),
            state: WorkflowState::Created,
            payload: input.to_payload()?,
            result: None,
            error_reason: None,
            reviewer_id: None,
            review_started_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decode the stored input.
    pub fn input(&self) -> Result<WorkflowInput> {
        WorkflowInput::from_payload(&self.payload)
    }

    /// Decode the stored result, if any.
    pub fn draft_result(&self) -> Option<DraftResult> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Apply a state update in memory. Stores use this to keep update
    /// semantics identical across backends.
    pub fn apply(&mut self, update: &InstanceUpdate) {
        self.state = update.to;
        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
        if let Some(reason) = &update.error_reason {
            self.error_reason = Some(reason.clone());
        }
        if let Some(reviewer) = &update.reviewer_id {
            self.reviewer_id = Some(reviewer.clone());
        }
        if let Some(at) = update.review_started_at {
            self.review_started_at = Some(at);
        }
        self.updated_at = update.at;
    }
}

/// A conditional state change, applied only when the instance is still in
/// the expected source state. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub to: WorkflowState,
    pub result: Option<serde_json::Value>,
    pub error_reason: Option<String>,
    pub reviewer_id: Option<String>,
    pub review_started_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl InstanceUpdate {
    /// Move to `to` without touching other fields.
    pub fn to(state: WorkflowState) -> Self {
        Self {
            to: state,
            result: None,
            error_reason: None,
            reviewer_id: None,
            review_started_at: None,
            at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error_reason(mut self, reason: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self
    }

    pub fn with_reviewer(mut self, reviewer_id: Option<String>, at: DateTime<Utc>) -> Self {
        self.reviewer_id = reviewer_id;
        self.review_started_at = Some(at);
        self
    }
}

/// Typed view of the opaque `result` blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftResult {
    /// Generated draft text.
    pub draft: String,
    /// Content approved by the reviewer (defaults to the draft).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    /// Reviewer who decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}

impl DraftResult {
    pub fn draft(text: impl Into<String>) -> Self {
        Self {
            draft: text.into(),
            final_content: None,
            decided_by: None,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> WorkflowInput {
        WorkflowInput::GeneralLetter {
            recipient: "Landlord".into(),
            topic: "Deposit".into(),
            instructions: "Ask for the deposit back".into(),
        }
    }

    #[test]
    fn test_instance_creation() {
        let instance = WorkflowInstance::new("user-1", &input()).unwrap();
        assert_eq!(instance.subject_id, "user-1");
        assert_eq!(instance.kind, WorkflowKind::GeneralLetter);
        assert_eq!(instance.state, WorkflowState::Created);
        assert!(instance.result.is_none());
        assert_eq!(instance.input().unwrap(), input());
    }

    #[test]
    fn test_apply_leaves_unset_fields() {
        let mut instance = WorkflowInstance::new("user-1", &input()).unwrap();
        let draft = DraftResult::draft("Dear Landlord").to_value().unwrap();
        instance.apply(&InstanceUpdate::to(WorkflowState::PendingReview).with_result(draft));
        assert_eq!(instance.state, WorkflowState::PendingReview);
        assert_eq!(instance.draft_result().unwrap().draft, "Dear Landlord");

        let at = Utc::now();
        instance.apply(
            &InstanceUpdate::to(WorkflowState::UnderReview)
                .with_reviewer(Some("rev-9".into()), at),
        );
        assert_eq!(instance.reviewer_id.as_deref(), Some("rev-9"));
        assert_eq!(instance.review_started_at, Some(at));
        assert!(instance.result.is_some());
        assert!(instance.error_reason.is_none());
    }

    #[test]
    fn test_draft_result_omits_empty_fields() {
        let value = DraftResult::draft("text").to_value().unwrap();
        assert_eq!(value, serde_json::json!({"draft": "text"}));
    }
}
