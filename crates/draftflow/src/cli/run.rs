use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use draftflow::Draftflow;

use super::load_config;

/// Run the outbound sweeper and stalled-workflow recovery.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "draftflow.toml")]
    pub config: String,

    /// Migrations directory path.
    #[arg(short, long, default_value = "migrations")]
    pub migrations_dir: String,

    /// Sweep interval in seconds (overrides config).
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long)]
    pub verbose: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let mut config = load_config(&self.config)?;
        draftflow::init_logging(&config.logging, self.verbose);

        println!();
        println!(
            "  {}  {} v{}",
            style("✉").bold(),
            style("draftflow").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();

        info!("Loaded configuration from {}", self.config);

        if let Some(secs) = self.sweep_interval {
            config.queue.sweep_interval_secs = secs;
        }

        println!(
            "  {} Sweeping every {}s, batch of {}",
            style("→").dim(),
            config.queue.sweep_interval_secs,
            config.queue.batch_size
        );
        println!(
            "  {} Recovering workflows stalled for {}s",
            style("→").dim(),
            config.engine.stalled_after_secs
        );
        println!();

        let runtime = Draftflow::builder()
            .config(config)
            .migrations_dir(&self.migrations_dir)
            .build()?;

        runtime.run().await?;
        Ok(())
    }
}
