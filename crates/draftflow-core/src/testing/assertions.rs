//! Test assertion macros and helpers.

use crate::audit::{AuditAction, AuditEntry};

/// Assert that a result is Ok, printing the error otherwise.
///
/// ```ignore
/// assert_ok!(ledger.refund("admin", 1).await);
/// ```
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
}

/// Assert that an error matches a specific variant.
///
/// ```ignore
/// assert_err_variant!(result, DraftflowError::InsufficientAllowance { .. });
/// ```
#[macro_export]
macro_rules! assert_err_variant {
    ($expr:expr, $variant:pat) => {
        match &$expr {
            Err($variant) => (),
            Err(e) => panic!(
                "assertion failed: expected {}, got {:?}",
                stringify!($variant),
                e
            ),
            Ok(v) => panic!(
                "assertion failed: expected Err({}), got Ok({:?})",
                stringify!($variant),
                v
            ),
        }
    };
}

/// Assert the state of a stored workflow instance.
///
/// ```ignore
/// assert_state!(instance, WorkflowState::PendingReview);
/// ```
#[macro_export]
macro_rules! assert_state {
    ($instance:expr, $state:expr) => {
        assert_eq!(
            $instance.state, $state,
            "instance {} is {}, expected {}",
            $instance.id, $instance.state, $state
        );
    };
}

/// Actions of an audit history, in order.
pub fn audit_actions(history: &[AuditEntry]) -> Vec<AuditAction> {
    history.iter().map(|e| e.action).collect()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::error::DraftflowError;
    use crate::workflow::WorkflowState;

    #[test]
    #[should_panic(expected = "expected Ok")]
    fn test_assert_ok_reports_the_error() {
        let result: Result<i32, String> = Err("boom".to_string());
        assert_ok!(result);
    }

    #[test]
    #[should_panic(expected = "expected DraftflowError::NotFound")]
    fn test_assert_err_variant_reports_the_mismatch() {
        let result: Result<(), DraftflowError> =
            Err(DraftflowError::Validation("recipient is required".into()));
        assert_err_variant!(result, DraftflowError::NotFound(_));
    }

    #[test]
    fn test_audit_actions() {
        let id = Uuid::new_v4();
        let history = vec![
            AuditEntry::new(id, AuditAction::Created, None, WorkflowState::Created),
            AuditEntry::new(
                id,
                AuditAction::Failed,
                Some(WorkflowState::Created),
                WorkflowState::Failed,
            ),
        ];
        assert_eq!(
            audit_actions(&history),
            vec![AuditAction::Created, AuditAction::Failed]
        );
    }
}
