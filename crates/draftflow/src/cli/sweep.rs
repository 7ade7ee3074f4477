use anyhow::Result;
use clap::Parser;
use console::style;

use draftflow::webhook_queue;

use super::runtime_for;

/// Deliver due outbound messages once and exit.
///
/// Meant for external schedulers; concurrent invocations never send the
/// same message twice.
#[derive(Parser)]
pub struct SweepCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "draftflow.toml")]
    pub config: String,

    /// Migrations directory path.
    #[arg(short, long, default_value = "migrations")]
    pub migrations_dir: String,

    /// Messages claimed in this sweep (overrides config).
    #[arg(short, long)]
    pub batch_size: Option<u32>,
}

impl SweepCommand {
    pub async fn execute(self) -> Result<()> {
        let runtime = runtime_for(&self.config, &self.migrations_dir)?;
        let batch_size = self
            .batch_size
            .unwrap_or(runtime.config().queue.batch_size)
            .max(1);

        let (db, store) = runtime.open_store().await?;
        let queue = webhook_queue(runtime.config(), store)?;
        let stats = queue.sweep(batch_size).await?;
        db.close().await;

        println!();
        println!(
            "  {} Swept {} message(s): {} sent, {} retrying, {} failed",
            style("✓").green(),
            stats.processed,
            stats.sent,
            stats.retried,
            stats.failed
        );
        if stats.skipped > 0 {
            println!(
                "  {} {} message(s) were claimed elsewhere mid-delivery",
                style("!").yellow(),
                stats.skipped
            );
        }
        if stats.remaining > 0 {
            println!(
                "  {} {} message(s) still due",
                style("ℹ").blue(),
                stats.remaining
            );
        }
        println!();

        Ok(())
    }
}
