//! Append-only transition history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowState;

/// What an audit entry records. One distinct action per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    AllowanceChecked,
    GenerationStarted,
    DraftReady,
    ReviewStarted,
    Approve,
    Reject,
    Completed,
    Failed,
    /// Compensating refund could not be applied.
    RefundFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AllowanceChecked => "allowance_checked",
            Self::GenerationStarted => "generation_started",
            Self::DraftReady => "draft_ready",
            Self::ReviewStarted => "review_started",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RefundFailed => "refund_failed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = crate::DraftflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "allowance_checked" => Self::AllowanceChecked,
            "generation_started" => Self::GenerationStarted,
            "draft_ready" => Self::DraftReady,
            "review_started" => Self::ReviewStarted,
            "approve" => Self::Approve,
            "reject" => Self::Reject,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "refund_failed" => Self::RefundFailed,
            other => {
                return Err(crate::DraftflowError::Serialization(format!(
                    "unknown audit action '{}'",
                    other
                )))
            }
        })
    }
}

/// One immutable history line for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Time-ordered (v7), breaks ties between equal timestamps.
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub action: AuditAction,
    /// `None` for the creation entry.
    pub from_state: Option<WorkflowState>,
    pub to_state: WorkflowState,
    /// `None` for system actions.
    pub actor_id: Option<String>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        workflow_instance_id: Uuid,
        action: AuditAction,
        from_state: Option<WorkflowState>,
        to_state: WorkflowState,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_instance_id,
            action,
            from_state,
            to_state,
            actor_id: None,
            notes: None,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder() {
        let id = Uuid::new_v4();
        let entry = AuditEntry::new(
            id,
            AuditAction::Reject,
            Some(WorkflowState::UnderReview),
            WorkflowState::Rejected,
        )
        .with_actor("rev-1")
        .with_notes("missing details");
        assert_eq!(entry.workflow_instance_id, id);
        assert_eq!(entry.actor_id.as_deref(), Some("rev-1"));
        assert_eq!(entry.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_ids_sort_in_creation_order() {
        let a = AuditEntry::new(Uuid::nil(), AuditAction::Created, None, WorkflowState::Created);
        let b = AuditEntry::new(Uuid::nil(), AuditAction::Failed, None, WorkflowState::Failed);
        assert!(a.id < b.id);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("approve".parse::<AuditAction>().unwrap(), AuditAction::Approve);
        assert!("approved".parse::<AuditAction>().is_err());
    }
}
