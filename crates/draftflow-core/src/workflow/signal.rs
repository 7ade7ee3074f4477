use serde::{Deserialize, Serialize};

use crate::error::{DraftflowError, Result};

/// Reviewer decision delivered to a suspended instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    /// Edited content replacing the draft on approval.
    #[serde(default)]
    pub final_content: Option<String>,
    /// Why the draft was rejected.
    #[serde(default)]
    pub reason: Option<String>,
    pub actor_id: String,
}

impl Decision {
    pub fn approve(actor_id: impl Into<String>) -> Self {
        Self {
            approved: true,
            final_content: None,
            reason: None,
            actor_id: actor_id.into(),
        }
    }

    pub fn reject(actor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            final_content: None,
            reason: Some(reason.into()),
            actor_id: actor_id.into(),
        }
    }

    pub fn with_final_content(mut self, content: impl Into<String>) -> Self {
        self.final_content = Some(content.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.actor_id.trim().is_empty() {
            return Err(DraftflowError::Validation("actor_id is required".into()));
        }
        if !self.approved && self.reason.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err(DraftflowError::Validation(
                "a rejection requires a reason".into(),
            ));
        }
        if self.approved
            && self
                .final_content
                .as_deref()
                .is_some_and(|c| c.trim().is_empty())
        {
            return Err(DraftflowError::Validation(
                "final_content must not be blank".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_json() {
        let decision: Decision = serde_json::from_value(serde_json::json!({
            "approved": false,
            "reason": "missing details",
            "actor_id": "rev-1"
        }))
        .unwrap();
        assert_eq!(decision, Decision::reject("rev-1", "missing details"));
        assert!(decision.validate().is_ok());
    }

    #[test]
    fn test_rejection_requires_reason() {
        let decision = Decision {
            approved: false,
            final_content: None,
            reason: Some("  ".into()),
            actor_id: "rev-1".into(),
        };
        assert!(decision.validate().is_err());
    }

    #[test]
    fn test_approval_validation() {
        assert!(Decision::approve("rev-1").validate().is_ok());
        assert!(Decision::approve("").validate().is_err());
        assert!(Decision::approve("rev-1")
            .with_final_content("")
            .validate()
            .is_err());
    }
}
