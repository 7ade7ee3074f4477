//! Migration runner guarded by a Postgres advisory lock.
//!
//! Several processes may start at once; only one applies migrations while
//! the others wait on the lock and then find nothing left to do.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use draftflow_core::error::{DraftflowError, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info, warn};

/// Advisory lock key, "DRAFT" in ASCII.
const MIGRATION_LOCK_ID: i64 = 0x4452414654;

/// A single migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. "0000_draftflow_internal" or "0001_add_index".
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Applied state of one known migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Applies built-in and user migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every pending migration. Returns the names applied.
    pub async fn run(&self, user_migrations: Vec<Migration>) -> Result<Vec<String>> {
        // Advisory locks are per session, so lock and unlock on one connection.
        let mut conn = self.pool.acquire().await?;
        acquire_lock(&mut conn).await?;

        let result = self.run_migrations_inner(user_migrations).await;

        if let Err(e) = release_lock(&mut conn).await {
            warn!(error = %e, "Failed to release migration lock");
        }

        result
    }

    /// Applied state of every built-in and user migration, in order.
    pub async fn status(&self, user_migrations: &[Migration]) -> Result<Vec<MigrationStatus>> {
        self.ensure_migrations_table().await?;
        let applied = self.get_applied_migrations().await?;

        Ok(get_all(user_migrations)
            .into_iter()
            .map(|m| MigrationStatus {
                applied_at: applied.get(&m.name).copied(),
                name: m.name,
            })
            .collect())
    }

    async fn run_migrations_inner(&self, user_migrations: Vec<Migration>) -> Result<Vec<String>> {
        self.ensure_migrations_table().await?;

        let applied = self.get_applied_migrations().await?;
        debug!(count = applied.len(), "Already applied migrations");

        let mut newly_applied = Vec::new();
        for migration in get_all(&user_migrations) {
            if !applied.contains_key(&migration.name) {
                self.apply_migration(&migration).await?;
                newly_applied.push(migration.name);
            }
        }

        Ok(newly_applied)
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS draftflow_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DraftflowError::Database(format!("Failed to create migrations table: {}", e))
        })?;
        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT name, applied_at FROM draftflow_migrations")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    DraftflowError::Database(format!("Failed to get applied migrations: {}", e))
                })?;

        Ok(rows.into_iter().collect())
    }

    /// Apply one migration and record it, in a single transaction.
    async fn apply_migration(&self, migration: &Migration) -> Result<()> {
        info!(migration = %migration.name, "Applying migration");

        let mut tx = self.pool.begin().await?;

        for statement in split_sql_statements(&migration.sql) {
            if is_blank_or_comment(&statement) {
                continue;
            }

            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    DraftflowError::Database(format!(
                        "Failed to apply migration '{}': {}",
                        migration.name, e
                    ))
                })?;
        }

        sqlx::query("INSERT INTO draftflow_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                DraftflowError::Database(format!(
                    "Failed to record migration '{}': {}",
                    migration.name, e
                ))
            })?;

        tx.commit().await?;

        info!(migration = %migration.name, "Migration applied");
        Ok(())
    }
}

fn get_all(user_migrations: &[Migration]) -> Vec<Migration> {
    let mut all = super::builtin::get_builtin_migrations();
    all.extend(user_migrations.iter().cloned());
    all
}

async fn acquire_lock(conn: &mut PoolConnection<Postgres>) -> Result<()> {
    debug!("Acquiring migration lock");
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut **conn)
        .await
        .map_err(|e| {
            DraftflowError::Database(format!("Failed to acquire migration lock: {}", e))
        })?;
    debug!("Migration lock acquired");
    Ok(())
}

async fn release_lock(conn: &mut PoolConnection<Postgres>) -> Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut **conn)
        .await
        .map_err(|e| {
            DraftflowError::Database(format!("Failed to release migration lock: {}", e))
        })?;
    debug!("Migration lock released");
    Ok(())
}

fn is_blank_or_comment(statement: &str) -> bool {
    statement.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    })
}

/// Split SQL into statements, keeping `$$`/`$tag$` quoted bodies intact.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);

        if c == '$' {
            let mut tag = String::from("$");
            while let Some(&next) = chars.peek() {
                if next == '$' || next.is_alphanumeric() || next == '_' {
                    chars.next();
                    tag.push(next);
                    current.push(next);
                    if next == '$' {
                        break;
                    }
                } else {
                    break;
                }
            }

            if tag.len() >= 2 && tag.ends_with('$') {
                match &dollar_tag {
                    Some(open) if *open == tag => dollar_tag = None,
                    None => dollar_tag = Some(tag),
                    Some(_) => {}
                }
            }
        }

        if c == ';' && dollar_tag.is_none() {
            let stmt = current.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current.clear();
        }
    }

    let stmt = current.trim().trim_end_matches(';').trim().to_string();
    if !stmt.is_empty() {
        statements.push(stmt);
    }

    statements
}

/// Load user migrations from a directory, sorted by file name.
///
/// Files are named like `0001_add_subject_index.sql`. A missing directory
/// yields no migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        debug!(dir = ?dir, "Migrations directory does not exist");
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().is_some_and(|e| e == "sql") {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| DraftflowError::Config("Invalid migration filename".into()))?
                .to_string();

            let sql = std::fs::read_to_string(&path)?;
            migrations.push(Migration::new(name, sql));
        }
    }

    migrations.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(count = migrations.len(), "Loaded user migrations");
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_migrations_from_nonexistent_dir() {
        let migrations = load_migrations_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();

        fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a migration").unwrap();
        fs::write(dir.path().join("0003_old.sql.bak"), "backup").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        let names: Vec<_> = migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["0001_first", "0002_second"]);
    }

    #[test]
    fn test_builtin_migrations_come_first() {
        let all = get_all(&[Migration::new("0001_extra", "SELECT 1")]);
        assert_eq!(all[0].name, "0000_draftflow_internal");
        assert_eq!(all[1].name, "0001_extra");
    }

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_sql_statements("SELECT 1; SELECT 2; SELECT 3");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_split_keeps_dollar_quoted_body() {
        let sql = r#"
CREATE FUNCTION guard() RETURNS trigger AS $$
BEGIN
    IF OLD.status = 'sent' THEN
        RAISE EXCEPTION 'sent';
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

SELECT 3;
"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("RAISE EXCEPTION 'sent';"));
        assert!(stmts[0].ends_with("$$ LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "SELECT 3");
    }

    #[test]
    fn test_split_builtin_schema() {
        let sql = &super::super::builtin::get_builtin_migrations()[0].sql;
        let stmts: Vec<_> = split_sql_statements(sql)
            .into_iter()
            .filter(|s| !is_blank_or_comment(s))
            .collect();
        assert!(stmts.iter().any(|s| s.contains("FUNCTION draftflow_outbox_guard")));
        assert!(stmts.iter().all(|s| !s.starts_with("END")));
    }

    #[test]
    fn test_comment_only_statement_is_skipped() {
        assert!(is_blank_or_comment("-- just a note\n   "));
        assert!(!is_blank_or_comment("-- note\nSELECT 1"));
    }
}
