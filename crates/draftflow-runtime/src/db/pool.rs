use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};

use draftflow_core::config::DatabaseConfig;
use draftflow_core::error::{DraftflowError, Result};

/// Shared Postgres connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
}

impl Database {
    /// Connect using the `[database]` section.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.pool_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| DraftflowError::Database(format!("Failed to connect: {}", e)))?;

        tracing::debug!(pool_size = config.pool_size, "Database pool created");

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| DraftflowError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
