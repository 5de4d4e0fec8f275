//! `queuectl`: a single-host, persistent background job queue.
//!
//! Each CLI invocation performs exactly one Control API operation and exits.
//! Worker processes (`worker run`) run independently of the CLI that started
//! them; see [`worker`] for the poll/claim/execute/finalize loop.

mod cli;
mod control;
mod executor;
mod paths;
mod supervisor;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use queuectl_core::{ConfigKey, JobState, JobStore};
use queuectl_store::SqliteJobStore;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use paths::Paths;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve()?;

    match cli.command {
        Command::InitDb => {
            let store = open_store(&paths).await?;
            control::init_db(&store).await?;
            println!("store initialized at {}", paths.db_path().display());
        }

        Command::Enqueue { json } => {
            let store = open_store(&paths).await?;
            let job = control::enqueue(&store, &json).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        Command::List { state } => {
            let store = open_store(&paths).await?;
            let filter = state
                .map(|s| s.parse::<JobState>())
                .transpose()
                .context("invalid --state value")?;
            let jobs = control::list(&store, filter).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }

        Command::Status => {
            let store = open_store(&paths).await?;
            let status = control::status(&store).await?;
            println!("workers: {}", status.workers.len());
            for (state, count) in &status.counts {
                println!("  {state}: {count}");
            }
        }

        Command::Dlq(DlqCommand::List) => {
            let store = open_store(&paths).await?;
            let jobs = control::dlq_list(&store).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }

        Command::Dlq(DlqCommand::Retry { id }) => {
            let store = open_store(&paths).await?;
            let job = control::dlq_retry(&store, &id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        Command::Config(ConfigCommand::Get { key }) => {
            let store = open_store(&paths).await?;
            let key: ConfigKey = key.parse().context("unknown config key")?;
            let value = control::config_get(&store, key).await?;
            println!("{value}");
        }

        Command::Config(ConfigCommand::Set { key, value }) => {
            let store = open_store(&paths).await?;
            let key: ConfigKey = key.parse().context("unknown config key")?;
            control::config_set(&store, key, &value).await?;
            println!("{} = {}", key.as_str(), value);
        }

        Command::Worker(WorkerCommand::Start { count }) => {
            let started = supervisor::start(count)?;
            println!("started {started} worker(s)");
        }

        Command::Worker(WorkerCommand::Stop) => {
            let report = supervisor::stop(&paths).await?;
            println!("stopped {} worker(s)", report.stopped);
            if !report.stuck.is_empty() {
                eprintln!(
                    "warning: {} worker(s) did not stop within the deadline: {:?}",
                    report.stuck.len(),
                    report.stuck
                );
            }
        }

        Command::Worker(WorkerCommand::Run) => {
            let store = open_store(&paths).await?;
            worker::run(store, &paths).await?;
        }
    }

    Ok(())
}

async fn open_store(paths: &Paths) -> Result<Arc<dyn JobStore>> {
    let store = SqliteJobStore::connect(&paths.db_path()).await?;
    store.init().await?;
    Ok(Arc::new(store))
}
