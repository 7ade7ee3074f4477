use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DraftflowError;

/// Lifecycle state of a workflow instance.
///
/// ```text
/// created → allowance_checked → generating → pending_review → under_review
///                                                 → approved → completed
///                                                 → rejected
/// created | allowance_checked | generating → failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Instance persisted, allowance not yet charged.
    Created,
    /// One unit of allowance has been deducted.
    AllowanceChecked,
    /// Draft generation in progress.
    Generating,
    /// Draft persisted, waiting for a reviewer to pick it up.
    PendingReview,
    /// A reviewer is assigned, waiting for the decision.
    UnderReview,
    /// Reviewer approved; finalisation not yet recorded.
    Approved,
    /// Reviewer rejected. Terminal.
    Rejected,
    /// Approved and finalised. Terminal.
    Completed,
    /// Pipeline failed. Terminal.
    Failed,
}

impl WorkflowState {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AllowanceChecked => "allowance_checked",
            Self::Generating => "generating",
            Self::PendingReview => "pending_review",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// Whether `next` is a legal edge from this state.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Created, AllowanceChecked)
                | (Created, Failed)
                | (AllowanceChecked, Generating)
                | (AllowanceChecked, Failed)
                | (Generating, PendingReview)
                | (Generating, Failed)
                | (PendingReview, UnderReview)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                | (Approved, Completed)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = DraftflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "allowance_checked" => Self::AllowanceChecked,
            "generating" => Self::Generating,
            "pending_review" => Self::PendingReview,
            "under_review" => Self::UnderReview,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => {
                return Err(DraftflowError::Serialization(format!(
                    "unknown workflow state '{}'",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WorkflowState; 9] = [
        WorkflowState::Created,
        WorkflowState::AllowanceChecked,
        WorkflowState::Generating,
        WorkflowState::PendingReview,
        WorkflowState::UnderReview,
        WorkflowState::Approved,
        WorkflowState::Rejected,
        WorkflowState::Completed,
        WorkflowState::Failed,
    ];

    #[test]
    fn test_state_string_conversion() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<WorkflowState>().unwrap(), state);
        }
        assert!("paused".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(ALL.iter().all(|next| !state.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_happy_path_edges() {
        use WorkflowState::*;
        let path = [
            Created,
            AllowanceChecked,
            Generating,
            PendingReview,
            UnderReview,
            Approved,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_review_states_cannot_fail() {
        assert!(!WorkflowState::PendingReview.can_transition_to(WorkflowState::Failed));
        assert!(!WorkflowState::UnderReview.can_transition_to(WorkflowState::Failed));
        assert!(!WorkflowState::PendingReview.can_transition_to(WorkflowState::Approved));
    }
}
