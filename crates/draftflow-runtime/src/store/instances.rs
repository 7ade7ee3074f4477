use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use draftflow_core::error::Result;
use draftflow_core::store::{Charge, InstanceStore, TransitionEffects, TransitionOutcome};
use draftflow_core::workflow::{InstanceUpdate, WorkflowInstance, WorkflowState};

use super::allowance::{account_from_row, credit_sql, deduct_sql};
use super::outbox::insert_message_on;
use super::PgStore;

const INSTANCE_COLUMNS: &str = "id, subject_id, kind, state, payload, result, error_reason, \
     reviewer_id, review_started_at, created_at, updated_at";

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error_reason: row.try_get("error_reason")?,
        reviewer_id: row.try_get("reviewer_id")?,
        review_started_at: row.try_get("review_started_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO draftflow_instances (
                id, subject_id, kind, state, payload, result, error_reason,
                reviewer_id, review_started_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            "#,
        )
        .bind(instance.id)
        .bind(&instance.subject_id)
        .bind(instance.kind.as_str())
        .bind(instance.state.as_str())
        .bind(&instance.payload)
        .bind(&instance.result)
        .bind(&instance.error_reason)
        .bind(&instance.reviewer_id)
        .bind(instance.review_started_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM draftflow_instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: WorkflowState,
        update: &InstanceUpdate,
        effects: &TransitionEffects,
    ) -> Result<TransitionOutcome> {
        // Dropping the transaction without commit rolls everything back.
        let mut tx = self.pool.begin().await?;

        // Locks the row, so a concurrent writer waits and then sees the
        // committed state.
        let locked: Option<(String,)> = sqlx::query_as(
            "SELECT subject_id FROM draftflow_instances WHERE id = $1 AND state = $2 FOR UPDATE",
        )
        .bind(id)
        .bind(from.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some((subject_id,)) = locked else {
            return Ok(TransitionOutcome::Conflict);
        };

        let account = match effects.charge {
            Some(Charge::Deduct(amount)) => {
                let row = sqlx::query(&deduct_sql())
                    .bind(&subject_id)
                    .bind(amount)
                    .bind(update.at)
                    .fetch_optional(&mut *tx)
                    .await?;
                match row {
                    Some(row) => Some(account_from_row(&row)?),
                    None => return Ok(TransitionOutcome::Insufficient),
                }
            }
            Some(Charge::Refund(amount)) => {
                let row = sqlx::query(&credit_sql())
                    .bind(&subject_id)
                    .bind(amount)
                    .bind(true)
                    .bind(update.at)
                    .fetch_optional(&mut *tx)
                    .await?;
                row.as_ref().map(account_from_row).transpose()?
            }
            None => None,
        };

        let message_id = match &effects.message {
            Some(message) => Some(insert_message_on(&mut tx, message).await?.0),
            None => None,
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE draftflow_instances
            SET
                state = $3,
                result = COALESCE($4, result),
                error_reason = COALESCE($5, error_reason),
                reviewer_id = COALESCE($6, reviewer_id),
                review_started_at = COALESCE($7, review_started_at),
                updated_at = $8
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(update.to.as_str())
        .bind(&update.result)
        .bind(&update.error_reason)
        .bind(&update.reviewer_id)
        .bind(update.review_started_at)
        .bind(update.at)
        .fetch_one(&mut *tx)
        .await?;
        let instance = instance_from_row(&row)?;

        tx.commit().await?;

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
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            WITH stalled AS (
                SELECT id
                FROM draftflow_instances
                WHERE state = ANY($1)
                  AND updated_at <= $2
                ORDER BY updated_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE draftflow_instances
            SET updated_at = $3
            WHERE id IN (SELECT id FROM stalled)
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(&states)
        .bind(stale_before)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(instance_from_row).collect()
    }
}
