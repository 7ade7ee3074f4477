mod allowance;
mod migrate;
mod run;
mod status;
mod sweep;

pub use allowance::AllowanceCommand;
pub use migrate::MigrateCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
pub use sweep::SweepCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

use draftflow::Draftflow;
use draftflow_core::config::DraftflowConfig;

/// draftflow - durable draft generation with human review
#[derive(Parser)]
#[command(name = "draftflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the outbound sweeper and stalled-workflow recovery.
    Run(RunCommand),

    /// Deliver due outbound messages once and exit.
    Sweep(SweepCommand),

    /// Manage database migrations.
    Migrate(MigrateCommand),

    /// Show a workflow instance and its audit history.
    Status(StatusCommand),

    /// Manage subject allowances.
    Allowance(AllowanceCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Sweep(cmd) => cmd.execute().await,
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Status(cmd) => cmd.execute().await,
            Commands::Allowance(cmd) => cmd.execute().await,
        }
    }
}

/// Load `.env` and the config file, failing early when the file is missing.
fn load_config(path: &str) -> Result<DraftflowConfig> {
    dotenvy::dotenv().ok();

    if !Path::new(path).exists() {
        anyhow::bail!(
            "Configuration file not found: {}\nPass --config or create draftflow.toml.",
            path
        );
    }

    Ok(DraftflowConfig::from_file(path)?)
}

/// Runtime for one-shot commands; logs go to stderr at the configured level.
fn runtime_for(config_path: &str, migrations_dir: &str) -> Result<Draftflow> {
    let config = load_config(config_path)?;
    draftflow::init_logging(&config.logging, false);

    Ok(Draftflow::builder()
        .config(config)
        .migrations_dir(migrations_dir)
        .build()?)
}
