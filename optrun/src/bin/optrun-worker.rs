//! Child process for the process launch mode.
//!
//! Reads one `RunAssignment` JSON document from stdin, runs it against the
//! PostgreSQL store named by `DATABASE_URL`, and prints the run's
//! `CompletionNotice` as the final stdout line. Logs go to stderr.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncReadExt;

use optrun::backend::RunAssignment;
use optrun::completion::{CompletionNotice, TerminalStatus};
use optrun::config::OrchestratorConfig;
use optrun::executor::{CommandEvaluator, RunExecutor};
use optrun::persistence::PostgresConnector;
use optrun::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = telemetry::init_tracing("info") {
        eprintln!("{err:#}");
    }

    match run().await {
        Ok(notice) => {
            let finished = notice.status == TerminalStatus::Finished;
            match serde_json::to_string(&notice) {
                Ok(line) => println!("{line}"),
                Err(err) => {
                    tracing::error!(error = %err, "could not encode completion notice");
                    return ExitCode::FAILURE;
                }
            }
            if finished {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "worker could not run its assignment");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<CompletionNotice> {
    let config = OrchestratorConfig::from_env()?;
    let persistence = config
        .persistence
        .context("DATABASE_URL must be set for optrun-worker")?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read run assignment from stdin")?;
    let assignment: RunAssignment =
        serde_json::from_str(input.trim()).context("failed to decode run assignment")?;

    tracing::info!(
        run_id = %assignment.run_id,
        experiment_id = %assignment.experiment_id(),
        "worker process starting run"
    );

    let connector = Arc::new(PostgresConnector::new(persistence));
    let mut executor = RunExecutor::new(assignment, connector, Arc::new(CommandEvaluator::new()));
    Ok(executor.execute().await)
}
