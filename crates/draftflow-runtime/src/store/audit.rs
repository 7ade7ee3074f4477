use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use draftflow_core::audit::AuditEntry;
use draftflow_core::error::Result;
use draftflow_core::store::AuditStore;

use super::PgStore;

fn entry_from_row(row: &PgRow) -> Result<AuditEntry> {
    let from_state: Option<String> = row.try_get("from_state")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        action: row.try_get::<String, _>("action")?.parse()?,
        from_state: from_state.map(|s| s.parse()).transpose()?,
        to_state: row.try_get::<String, _>("to_state")?.parse()?,
        actor_id: row.try_get("actor_id")?,
        notes: row.try_get("notes")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO draftflow_audit_log (
                id, workflow_instance_id, action, from_state, to_state,
                actor_id, notes, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.workflow_instance_id)
        .bind(entry.action.as_str())
        .bind(entry.from_state.map(|s| s.as_str()))
        .bind(entry.to_state.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.notes)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_instance(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_instance_id, action, from_state, to_state,
                   actor_id, notes, metadata, created_at
            FROM draftflow_audit_log
            WHERE workflow_instance_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}
