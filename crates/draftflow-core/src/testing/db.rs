//! PostgreSQL access for integration tests.
//!
//! Only `TEST_DATABASE_URL` is consulted, never `DATABASE_URL`, so a stray
//! `.env` cannot point the suite at a real database. Tests that need
//! Postgres call [`TestDatabase::from_env_or_skip`] and return early when it
//! yields `None`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{DraftflowError, Result};

/// Environment variable holding the test database URL.
pub const TEST_DATABASE_URL: &str = "TEST_DATABASE_URL";

/// Connection to the server used by database tests.
pub struct TestDatabase {
    pool: PgPool,
    url: String,
}

impl TestDatabase {
    /// Connect to the database at `url`.
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Connect using `TEST_DATABASE_URL`.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var(TEST_DATABASE_URL).map_err(|_| {
            DraftflowError::Config(format!(
                "{} not set. Set it explicitly for database tests.",
                TEST_DATABASE_URL
            ))
        })?;
        Self::from_url(&url).await
    }

    /// Connect using `TEST_DATABASE_URL`, or `None` when it is unset.
    pub async fn from_env_or_skip() -> Option<Self> {
        if std::env::var(TEST_DATABASE_URL).is_err() {
            eprintln!("{} not set, skipping database test", TEST_DATABASE_URL);
            return None;
        }
        match Self::from_env().await {
            Ok(db) => Some(db),
            Err(e) => {
                eprintln!("test database unavailable, skipping: {}", e);
                None
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run raw SQL.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Create a fresh database for one test.
    ///
    /// Each call creates a uniquely named database so parallel tests never
    /// see each other's rows.
    pub async fn isolated(&self, test_name: &str) -> Result<IsolatedTestDb> {
        let db_name = format!(
            "draftflow_test_{}_{}",
            sanitize_db_name(test_name),
            uuid::Uuid::new_v4().simple()
        );

        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name))
            .execute(&self.pool)
            .await?;

        let test_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&replace_db_name(&self.url, &db_name))
            .await?;

        Ok(IsolatedTestDb {
            pool: test_pool,
            db_name,
            base_url: self.url.clone(),
        })
    }
}

/// A database that lives for one test.
pub struct IsolatedTestDb {
    pool: PgPool,
    db_name: String,
    base_url: String,
}

impl IsolatedTestDb {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Drop the database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await?;

        // Lingering connections would block the drop.
        let _ = sqlx::query(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}'",
            self.db_name
        ))
        .execute(&pool)
        .await;

        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.db_name))
            .execute(&pool)
            .await?;

        Ok(())
    }
}

fn sanitize_db_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(32)
        .collect()
}

/// Replace the database name in a connection URL, keeping query params.
fn replace_db_name(url: &str, new_db: &str) -> String {
    match url.rfind('/') {
        Some(idx) => {
            let base = &url[..=idx];
            match url[idx + 1..].find('?') {
                Some(query_idx) => format!("{}{}{}", base, new_db, &url[idx + 1 + query_idx..]),
                None => format!("{}{}", base, new_db),
            }
        }
        None => format!("{}/{}", url, new_db),
    }
}
