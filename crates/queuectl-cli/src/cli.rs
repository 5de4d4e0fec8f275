//! Command-line surface: one subcommand per Control API operation, plus the
//! hidden `worker run` entry point used only by the supervisor.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "queuectl", about = "Single-host persistent background job queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the store's schema if it doesn't already exist.
    InitDb,

    /// Enqueue a job from a JSON object: {"command": "...", "id": "...", "max_retries": N}.
    Enqueue {
        json: String,
    },

    /// List jobs, optionally filtered by state.
    List {
        #[arg(long = "state")]
        state: Option<String>,
    },

    /// Show worker counts and job counts by state.
    Status,

    #[command(subcommand)]
    Dlq(DlqCommand),

    #[command(subcommand)]
    Config(ConfigCommand),

    #[command(subcommand)]
    Worker(WorkerCommand),
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// Shorthand for `list --state dead`.
    List,
    /// Move a dead-lettered job back to `pending`.
    Retry { id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Spawn detached worker processes.
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Signal all live workers to stop, waiting up to 30s for each.
    Stop,
    /// Internal: run as a worker process. Invoked only by `worker start`.
    #[command(hide = true)]
    Run,
}
