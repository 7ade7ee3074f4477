use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use draftflow_runtime::migrations::{load_migrations_from_dir, MigrationRunner};
use draftflow_runtime::Database;

use super::load_config;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "draftflow.toml", global = true)]
    pub config: String,

    /// Migrations directory path.
    #[arg(short, long, default_value = "migrations", global = true)]
    pub migrations_dir: String,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply all pending migrations.
    Up,

    /// Show migration status.
    Status,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;
        draftflow::init_logging(&config.logging, false);

        let db = Database::from_config(&config.database).await?;
        let runner = MigrationRunner::new(db.pool().clone());
        let available = load_migrations_from_dir(Path::new(&self.migrations_dir))?;

        println!();
        match self.action {
            MigrateAction::Up => {
                println!("  {} Running pending migrations...", style("→").dim());
                let applied = runner.run(available).await?;

                if applied.is_empty() {
                    println!("  {} Schema is up to date", style("ℹ").blue());
                } else {
                    for name in &applied {
                        println!("  {} Applied: {}", style("✓").green(), name);
                    }
                }
            }

            MigrateAction::Status => {
                let status = runner.status(&available).await?;
                let applied = status.iter().filter(|m| m.is_applied()).count();

                for m in &status {
                    match m.applied_at {
                        Some(at) => println!(
                            "  {} {} {} ({})",
                            style("✓").green(),
                            style(&m.name).cyan(),
                            style("at").dim(),
                            at.format("%Y-%m-%d %H:%M:%S")
                        ),
                        None => println!("  {} {}", style("○").yellow(), style(&m.name).yellow()),
                    }
                }

                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    applied,
                    status.len() - applied
                );
            }
        }
        println!();

        db.close().await;
        Ok(())
    }
}
