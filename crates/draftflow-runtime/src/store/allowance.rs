use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use draftflow_core::allowance::{AllowanceAccount, CreditMode};
use draftflow_core::error::Result;
use draftflow_core::store::AllowanceStore;

use super::PgStore;

const ACCOUNT_COLUMNS: &str = "subject_id, balance, unlimited, version, created_at, updated_at";

pub(super) fn account_from_row(row: &PgRow) -> Result<AllowanceAccount> {
    Ok(AllowanceAccount {
        subject_id: row.try_get("subject_id")?,
        balance: row.try_get("balance")?,
        unlimited: row.try_get("unlimited")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Conditional deduct. Binds `subject_id`, `amount`, `now`; no row when the
/// balance is short or the account is missing.
pub(super) fn deduct_sql() -> String {
    // The row lock taken by UPDATE makes concurrent deducts re-check the
    // balance against the committed value.
    format!(
        r#"
        UPDATE draftflow_allowances
        SET
            balance = CASE WHEN unlimited THEN balance ELSE balance - $2 END,
            version = CASE WHEN unlimited THEN version ELSE version + 1 END,
            updated_at = CASE WHEN unlimited THEN updated_at ELSE $3 END
        WHERE subject_id = $1
          AND (unlimited OR balance >= $2)
        RETURNING {}
        "#,
        ACCOUNT_COLUMNS
    )
}

/// Credit. Binds `subject_id`, `amount`, `is_refund`, `now`.
pub(super) fn credit_sql() -> String {
    format!(
        r#"
        UPDATE draftflow_allowances
        SET
            balance = CASE WHEN unlimited AND $3 THEN balance ELSE balance + $2 END,
            version = CASE WHEN unlimited AND $3 THEN version ELSE version + 1 END,
            updated_at = CASE WHEN unlimited AND $3 THEN updated_at ELSE $4 END
        WHERE subject_id = $1
        RETURNING {}
        "#,
        ACCOUNT_COLUMNS
    )
}

#[async_trait]
impl AllowanceStore for PgStore {
    async fn upsert_account(
        &self,
        subject_id: &str,
        initial_balance: i64,
        unlimited: bool,
        now: DateTime<Utc>,
    ) -> Result<AllowanceAccount> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO draftflow_allowances (subject_id, balance, unlimited, version, created_at, updated_at)
            VALUES ($1, GREATEST($2, 0), $3, 0, $4, $4)
            ON CONFLICT (subject_id) DO UPDATE SET
                balance = GREATEST(draftflow_allowances.balance, EXCLUDED.balance),
                unlimited = EXCLUDED.unlimited,
                version = draftflow_allowances.version + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(subject_id)
        .bind(initial_balance)
        .bind(unlimited)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        account_from_row(&row)
    }

    async fn get_account(&self, subject_id: &str) -> Result<Option<AllowanceAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM draftflow_allowances WHERE subject_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn deduct(
        &self,
        subject_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>> {
        let row = sqlx::query(&deduct_sql())
            .bind(subject_id)
            .bind(amount)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn credit(
        &self,
        subject_id: &str,
        amount: i64,
        mode: CreditMode,
        now: DateTime<Utc>,
    ) -> Result<Option<AllowanceAccount>> {
        let row = sqlx::query(&credit_sql())
            .bind(subject_id)
            .bind(amount)
            .bind(mode == CreditMode::Refund)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }
}
