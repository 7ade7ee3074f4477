use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use draftflow_runtime::AllowanceLedger;

use super::runtime_for;

/// Manage subject allowances.
#[derive(Parser)]
pub struct AllowanceCommand {
    #[command(subcommand)]
    pub action: AllowanceAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "draftflow.toml", global = true)]
    pub config: String,

    /// Migrations directory path.
    #[arg(short, long, default_value = "migrations", global = true)]
    pub migrations_dir: String,
}

#[derive(Subcommand)]
pub enum AllowanceAction {
    /// Create an account, or raise an existing one to at least this balance.
    Open {
        subject_id: String,

        #[arg(default_value = "0")]
        balance: i64,

        /// Never debit this subject.
        #[arg(long)]
        unlimited: bool,
    },

    /// Add credits to an existing account.
    Grant { subject_id: String, amount: i64 },

    /// Show the remaining balance.
    Show { subject_id: String },
}

impl AllowanceCommand {
    pub async fn execute(self) -> Result<()> {
        let runtime = runtime_for(&self.config, &self.migrations_dir)?;
        let (db, store) = runtime.open_store().await?;
        let ledger = AllowanceLedger::new(store, runtime.config().engine.store_retry_policy());

        let result = run_action(&ledger, self.action).await;
        db.close().await;
        result
    }
}

async fn run_action(ledger: &AllowanceLedger, action: AllowanceAction) -> Result<()> {
    println!();
    match action {
        AllowanceAction::Open {
            subject_id,
            balance,
            unlimited,
        } => {
            let account = ledger.open_account(&subject_id, balance, unlimited).await?;
            println!(
                "  {} {} has {} credit(s)",
                style("✓").green(),
                style(&account.subject_id).cyan(),
                account.remaining()
            );
        }

        AllowanceAction::Grant { subject_id, amount } => {
            let balance = ledger.grant(&subject_id, amount).await?;
            println!(
                "  {} Granted {} to {}, now {}",
                style("✓").green(),
                amount,
                style(&subject_id).cyan(),
                balance
            );
        }

        AllowanceAction::Show { subject_id } => match ledger.account(&subject_id).await? {
            Some(account) => println!(
                "  {} {} credit(s), updated {}",
                style(&subject_id).cyan(),
                account.remaining(),
                account.updated_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("  {} No account for {}", style("ℹ").blue(), subject_id),
        },
    }
    println!();
    Ok(())
}
