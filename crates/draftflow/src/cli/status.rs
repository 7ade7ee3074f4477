use anyhow::Result;
use clap::Parser;
use console::style;
use serde_json::json;
use uuid::Uuid;

use draftflow_core::store::InstanceStore;
use draftflow_runtime::AuditLog;

use super::runtime_for;

/// Show a workflow instance and its audit history.
#[derive(Parser)]
pub struct StatusCommand {
    /// Workflow instance ID.
    pub instance_id: Uuid,

    /// Configuration file path.
    #[arg(short, long, default_value = "draftflow.toml")]
    pub config: String,

    /// Migrations directory path.
    #[arg(short, long, default_value = "migrations")]
    pub migrations_dir: String,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

impl StatusCommand {
    pub async fn execute(self) -> Result<()> {
        let runtime = runtime_for(&self.config, &self.migrations_dir)?;
        let (db, store) = runtime.open_store().await?;

        let instance = store.get_instance(self.instance_id).await?;
        let Some(instance) = instance else {
            db.close().await;
            anyhow::bail!("Workflow instance not found: {}", self.instance_id);
        };
        let history = AuditLog::new(store.clone())
            .history(self.instance_id)
            .await?;
        db.close().await;

        if self.json {
            let report = json!({
                "instance": instance,
                "history": history,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!();
        println!(
            "  {} {} ({})",
            style("Instance").bold(),
            style(instance.id).cyan(),
            instance.kind
        );
        println!("  {} {}", style("subject:").dim(), instance.subject_id);
        println!("  {} {}", style("state:").dim(), style(instance.state).bold());
        if let Some(reviewer) = &instance.reviewer_id {
            println!("  {} {}", style("reviewer:").dim(), reviewer);
        }
        if let Some(reason) = &instance.error_reason {
            println!("  {} {}", style("reason:").dim(), style(reason).yellow());
        }
        println!();

        if history.is_empty() {
            println!("  {} No audit history", style("ℹ").blue());
        }
        for entry in &history {
            let from = entry
                .from_state
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {:<22} {} → {}{}",
                style(entry.created_at.format("%Y-%m-%d %H:%M:%S")).dim(),
                entry.action.as_str(),
                from,
                entry.to_state,
                entry
                    .actor_id
                    .as_deref()
                    .map(|a| format!(" by {}", a))
                    .unwrap_or_default()
            );
        }
        println!();

        Ok(())
    }
}
