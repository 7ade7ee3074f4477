//! Long-running draftflow process.
//!
//! Wires configuration, the database, migrations and the workflow engine
//! together, then drives the outbound sweeper and stalled-workflow recovery
//! until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use draftflow_core::config::DraftflowConfig;
use draftflow_core::error::{DraftflowError, Result};
use draftflow_runtime::migrations::{load_migrations_from_dir, Migration, MigrationRunner};
use draftflow_runtime::{
    Database, HttpDraftGenerator, OutboundQueue, PgStore, StalledRecovery, Sweeper,
    WebhookSender, WorkflowEngine,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    pub use draftflow_core::config::DraftflowConfig;
    pub use draftflow_core::error::{DraftflowError, Result};
    pub use draftflow_core::workflow::{Decision, WorkflowInput, WorkflowKind, WorkflowState};
    pub use draftflow_core::{Balance, DraftGenerator, NotificationSender};
    pub use draftflow_runtime::{StatusReport, WorkflowEngine};

    pub use crate::{Draftflow, DraftflowBuilder, Services};
}

/// Connected services sharing one pool.
pub struct Services {
    pub db: Database,
    pub store: Arc<PgStore>,
    pub engine: Arc<WorkflowEngine>,
}

/// The draftflow runtime.
pub struct Draftflow {
    config: DraftflowConfig,
    migrations_dir: PathBuf,
    extra_migrations: Vec<Migration>,
    shutdown: CancellationToken,
}

impl Draftflow {
    pub fn builder() -> DraftflowBuilder {
        DraftflowBuilder::new()
    }

    pub fn config(&self) -> &DraftflowConfig {
        &self.config
    }

    /// Token cancelled when the runtime begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect, apply migrations and build the engine with the HTTP
    /// generator and webhook notifier from config.
    pub async fn connect(&self) -> Result<Services> {
        let (db, store) = self.open_store().await?;
        let generator = Arc::new(HttpDraftGenerator::from_config(&self.config.generation)?);
        let sender = Arc::new(WebhookSender::from_config(&self.config.notifier)?);
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            generator,
            sender,
            &self.config,
        ));

        Ok(Services { db, store, engine })
    }

    /// Connect and apply migrations without building the engine.
    pub async fn open_store(&self) -> Result<(Database, Arc<PgStore>)> {
        let db = Database::from_config(&self.config.database).await?;
        self.migrate(&db).await?;
        let store = Arc::new(PgStore::from_database(&db));
        Ok((db, store))
    }

    async fn migrate(&self, db: &Database) -> Result<()> {
        let mut migrations = load_migrations_from_dir(&self.migrations_dir)?;
        migrations.extend(self.extra_migrations.iter().cloned());

        let applied = MigrationRunner::new(db.pool().clone())
            .run(migrations)
            .await?;
        if !applied.is_empty() {
            tracing::info!(count = applied.len(), "Applied migrations");
        }
        Ok(())
    }

    /// Run the sweeper and recovery loops until ctrl-c or [`Self::shutdown`].
    pub async fn run(self) -> Result<()> {
        let services = self.connect().await?;
        services.db.health_check().await?;

        let sweeper = Sweeper::new(services.engine.queue().clone(), &self.config.queue);
        let recovery = StalledRecovery::new(services.engine.clone(), &self.config.engine);

        let sweeper_handle = {
            let token = self.shutdown.clone();
            tokio::spawn(async move { sweeper.run(token).await })
        };
        let recovery_handle = {
            let token = self.shutdown.clone();
            tokio::spawn(async move { recovery.run(token).await })
        };

        tracing::info!("draftflow runtime started");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("Received shutdown notification");
            }
        }

        tracing::info!("Starting graceful shutdown...");
        self.shutdown.cancel();

        for (name, handle) in [("sweeper", sweeper_handle), ("recovery", recovery_handle)] {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        services.db.close().await;
        tracing::info!("draftflow runtime stopped");
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Builder for [`Draftflow`].
pub struct DraftflowBuilder {
    config: Option<DraftflowConfig>,
    migrations_dir: PathBuf,
    extra_migrations: Vec<Migration>,
}

impl DraftflowBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            migrations_dir: PathBuf::from("migrations"),
            extra_migrations: Vec::new(),
        }
    }

    /// Directory of user migrations, named like `0001_add_index.sql`.
    /// Defaults to `./migrations`.
    pub fn migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_dir = path.into();
        self
    }

    /// Add a migration programmatically.
    pub fn migration(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.extra_migrations.push(Migration::new(name, sql));
        self
    }

    pub fn config(mut self, config: DraftflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load configuration from a TOML file.
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let config = DraftflowConfig::from_file(path)?;
        Ok(self.config(config))
    }

    pub fn build(self) -> Result<Draftflow> {
        let config = self
            .config
            .ok_or_else(|| DraftflowError::Config("Configuration is required".to_string()))?;

        Ok(Draftflow {
            config,
            migrations_dir: self.migrations_dir,
            extra_migrations: self.extra_migrations,
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for DraftflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue wired to the configured webhook, for one-shot sweeps.
pub fn webhook_queue(config: &DraftflowConfig, store: Arc<PgStore>) -> Result<OutboundQueue> {
    let sender = Arc::new(WebhookSender::from_config(&config.notifier)?);
    Ok(OutboundQueue::new(store, sender, config.queue.clone()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_builder_requires_config() {
        let result = DraftflowBuilder::new().build();
        assert!(matches!(result, Err(DraftflowError::Config(_))));
    }

    #[test]
    fn test_builder_with_config() {
        let runtime = Draftflow::builder()
            .config(DraftflowConfig::default_with_database_url(
                "postgres://localhost/draftflow",
            ))
            .migration("0001_extra", "SELECT 1")
            .build()
            .unwrap();

        assert_eq!(runtime.config().queue.batch_size, 50);
        assert_eq!(runtime.extra_migrations.len(), 1);
        assert_eq!(runtime.migrations_dir, PathBuf::from("migrations"));
    }

    #[test]
    fn test_builder_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgres://localhost/draftflow\"\n\n[queue]\nbatch_size = 7"
        )
        .unwrap();

        let runtime = Draftflow::builder()
            .config_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(runtime.config().queue.batch_size, 7);
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let runtime = Draftflow::builder()
            .config(DraftflowConfig::default_with_database_url("postgres://x/y"))
            .build()
            .unwrap();
        let token = runtime.shutdown_token();
        assert!(!token.is_cancelled());
        runtime.shutdown();
        assert!(token.is_cancelled());
    }
}
