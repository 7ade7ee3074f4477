//! Per-subject credit accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A subject's credit balance.
///
/// `balance` never goes below zero. Unlimited accounts are never debited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceAccount {
    pub subject_id: String,
    pub balance: i64,
    pub unlimited: bool,
    /// Bumped on every mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AllowanceAccount {
    pub fn new(subject_id: impl Into<String>, balance: i64, unlimited: bool) -> Self {
        let now = Utc::now();
        Self {
            subject_id: subject_id.into(),
            balance: balance.max(0),
            unlimited,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> Balance {
        if self.unlimited {
            Balance::Unlimited
        } else {
            Balance::Limited(self.balance)
        }
    }

    /// Whether a deduction of `amount` would succeed.
    pub fn can_cover(&self, amount: i64) -> bool {
        self.unlimited || self.balance >= amount
    }
}

/// Remaining balance as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Balance {
    Limited(i64),
    Unlimited,
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// How a credit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// Compensation for an earlier deduction. No-op on unlimited accounts.
    Refund,
    /// Top-up, e.g. after a purchase.
    Grant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining() {
        assert_eq!(
            AllowanceAccount::new("a", 3, false).remaining(),
            Balance::Limited(3)
        );
        assert_eq!(
            AllowanceAccount::new("a", 0, true).remaining(),
            Balance::Unlimited
        );
    }

    #[test]
    fn test_negative_opening_balance_is_clamped() {
        assert_eq!(AllowanceAccount::new("a", -5, false).balance, 0);
    }

    #[test]
    fn test_can_cover() {
        let account = AllowanceAccount::new("a", 1, false);
        assert!(account.can_cover(1));
        assert!(!account.can_cover(2));
        assert!(AllowanceAccount::new("b", 0, true).can_cover(100));
    }
}
