//! fedlab CLI
//!
//! Runs one experiment that already exists in the database.

use anyhow::{Context, Result};
use clap::Parser;
use fedlab::experiment::SqliteStore;
use fedlab::logging::init_cli_tracing;
use fedlab::orchestrator::RoundOrchestrator;
use fedlab::settings::RunnerSettings;

#[derive(Parser)]
#[command(name = "fedlab")]
#[command(author, version, about = "Run a federated-learning experiment", long_about = None)]
struct Cli {
    /// ID of the experiment row to run
    #[arg(value_name = "EXPERIMENT_ID")]
    experiment_id: i64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_cli_tracing("info");

    let settings = RunnerSettings::from_env().context("Failed to read runner settings")?;
    let store = SqliteStore::new(&settings.database_url);
    let mut orchestrator = RoundOrchestrator::new(cli.experiment_id, store, settings)
        .context("Failed to prepare experiment run")?;

    let summary = orchestrator
        .run()
        .with_context(|| format!("Experiment {} failed", cli.experiment_id))?;

    tracing::info!(
        experiment = summary.experiment_id,
        rounds = summary.rounds.len(),
        final_accuracy = ?summary.final_accuracy,
        final_loss = ?summary.final_loss,
        "experiment completed"
    );
    Ok(())
}
