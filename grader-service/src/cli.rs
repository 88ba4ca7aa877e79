use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Asynchronous grading worker and submission tool.
#[derive(Debug, Parser)]
#[command(name = "grader-service", version, about)]
pub struct Cli {
    /// Path to configuration file (overrides GRADER_CONFIG_PATH)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Human-readable logs instead of JSON
    #[arg(short, long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume the queue and grade submissions until interrupted
    Work,
    /// Store a submission and queue it for grading
    Submit {
        /// File containing the submission payload
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        user: Uuid,
        #[arg(short, long)]
        assessment: Uuid,
        /// Defaults to a fresh id
        #[arg(short, long)]
        submission: Option<Uuid>,
    },
    /// Print the tracked state of a job
    Status {
        job_id: String,
    },
}
