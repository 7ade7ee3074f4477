use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use draftflow_core::error::Result;
use draftflow_core::outbox::{QueueStats, QueuedMessage};
use draftflow_core::store::{FailureOutcome, OutboxStore};

use super::PgStore;

const MESSAGE_COLUMNS: &str = "id, destination, payload, dedupe_key, status, attempts, \
     max_attempts, next_attempt_at, last_error, claim_token, claimed_until, created_at, sent_at";

fn message_from_row(row: &PgRow) -> Result<QueuedMessage> {
    Ok(QueuedMessage {
        id: row.try_get("id")?,
        destination: row.try_get("destination")?,
        payload: row.try_get("payload")?,
        dedupe_key: row.try_get("dedupe_key")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        claim_token: row.try_get("claim_token")?,
        claimed_until: row.try_get("claimed_until")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

/// Insert with dedupe on `conn`, which may be inside a transaction.
pub(super) async fn insert_message_on(
    conn: &mut PgConnection,
    message: &QueuedMessage,
) -> Result<(Uuid, bool)> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO draftflow_outbox (
            id, destination, payload, dedupe_key, status, attempts,
            max_attempts, next_attempt_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (dedupe_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(message.id)
    .bind(&message.destination)
    .bind(&message.payload)
    .bind(&message.dedupe_key)
    .bind(message.status.as_str())
    .bind(message.attempts)
    .bind(message.max_attempts)
    .bind(message.next_attempt_at)
    .bind(message.created_at)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = inserted {
        return Ok((id, true));
    }

    // Only a dedupe conflict skips the insert.
    let (existing,): (Uuid,) =
        sqlx::query_as("SELECT id FROM draftflow_outbox WHERE dedupe_key = $1")
            .bind(&message.dedupe_key)
            .fetch_one(&mut *conn)
            .await?;

    Ok((existing, false))
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn insert_message(&self, message: &QueuedMessage) -> Result<(Uuid, bool)> {
        let mut conn = self.pool.acquire().await?;
        insert_message_on(&mut conn, message).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
        token: Uuid,
    ) -> Result<Vec<QueuedMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM draftflow_outbox
                WHERE status = 'pending'
                  AND next_attempt_at <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE draftflow_outbox
            SET claim_token = $4, claimed_until = $2
            WHERE id IN (SELECT id FROM due)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .bind(token)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(|m| (m.next_attempt_at, m.id));
        Ok(messages)
    }

    async fn claim_message(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        token: Uuid,
    ) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE draftflow_outbox
            SET claim_token = $4, claimed_until = $3
            WHERE id = $1
              AND status = 'pending'
              AND next_attempt_at <= $2
              AND (claimed_until IS NULL OR claimed_until <= $2)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn mark_sent(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE draftflow_outbox
            SET
                status = 'sent',
                sent_at = $3,
                claim_token = NULL,
                claimed_until = NULL
            WHERE id = $1 AND claim_token = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        token: Uuid,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<bool> {
        let result = match outcome {
            FailureOutcome::Retry { next_attempt_at } => {
                sqlx::query(
                    r#"
                    UPDATE draftflow_outbox
                    SET
                        attempts = attempts + 1,
                        last_error = $3,
                        next_attempt_at = $4,
                        claim_token = NULL,
                        claimed_until = NULL
                    WHERE id = $1 AND claim_token = $2 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(token)
                .bind(error)
                .bind(next_attempt_at)
                .execute(&self.pool)
                .await?
            }
            FailureOutcome::Terminal => {
                sqlx::query(
                    r#"
                    UPDATE draftflow_outbox
                    SET
                        status = 'failed',
                        attempts = attempts + 1,
                        last_error = $3,
                        claim_token = NULL,
                        claimed_until = NULL
                    WHERE id = $1 AND claim_token = $2 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(token)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM draftflow_outbox WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn count_by_status(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM draftflow_outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            sent: row.try_get::<i64, _>("sent")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
        })
    }

    async fn count_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM draftflow_outbox WHERE status = 'pending' AND next_attempt_at <= $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}
