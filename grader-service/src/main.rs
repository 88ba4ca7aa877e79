//! Grader service entry point.
//!
//! `work` runs the worker pool until SIGINT/SIGTERM, `submit` queues one
//! submission, `status` prints what the tracker knows about a job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use uuid::Uuid;

use grader_config::{Config, BROKER_MEMORY};
use grader_job_queue::{JobId, JobQueue};
use grader_workers::LifecycleTracker;
use grader_service::config_helpers::{
    artifacts_from_config, broker_from_config, load_validated_config, queue_options_from_config,
    tracker_from_config,
};
use grader_service::{GraderService, ServiceDeps, Submission, SubmissionService};

mod cli;
mod shutdown;
mod tracing_setup;

use cli::{Cli, Command};
use shutdown::install_shutdown_handler;
use tracing_setup::install_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = ignore_missing(dotenvy::dotenv()) {
        eprintln!("[STARTUP] failed to load .env: {e}");
        return Err(e.into());
    }
    let cli = Cli::parse();

    // Resolve config path: CLI > environment variable
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("GRADER_CONFIG_PATH").ok().map(PathBuf::from));
    let config = load_config(config_path.as_deref())?;

    install_tracing(&config.logging, cli.verbose, cli.pretty);
    tracing::debug!(config_path = ?config_path, "configuration loaded");

    match cli.command {
        Command::Work => work(&config).await,
        Command::Submit {
            file,
            user,
            assessment,
            submission,
        } => submit(&config, &file, user, assessment, submission).await,
        Command::Status { job_id } => status(&config, JobId::new(job_id)).await,
    }
}

/// A missing .env file is fine; a malformed one is not.
fn ignore_missing<T>(loaded: Result<T, dotenvy::Error>) -> Result<(), dotenvy::Error> {
    match loaded {
        Ok(_) => Ok(()),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Load and validate configuration from file (if any) and environment.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    load_validated_config(path).map_err(|e| {
        eprintln!("[STARTUP] {e}");
        anyhow::Error::new(e)
    })
}

async fn work(config: &Config) -> anyhow::Result<()> {
    let signal = install_shutdown_handler();
    let service = GraderService::start(config, ServiceDeps::default())
        .await
        .context("failed to start grader service")?;
    service
        .run_until(signal)
        .await
        .context("grader service did not shut down cleanly")?;
    Ok(())
}

async fn submit(
    config: &Config,
    file: &Path,
    user_id: Uuid,
    assessment_id: Uuid,
    submission_id: Option<Uuid>,
) -> anyhow::Result<()> {
    if config.queue.broker == BROKER_MEMORY {
        bail!("submit needs a broker shared with the workers; set queue.broker = \"spool\"");
    }
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read submission {}", file.display()))?;

    let artifacts = Arc::new(artifacts_from_config(&config.storage).await?);
    let tracker = tracker_from_config(&config.storage).await?;
    let queue = JobQueue::new(
        broker_from_config(&config.queue),
        queue_options_from_config(&config.queue),
    );
    let submissions = SubmissionService::new(artifacts, queue.clone(), Arc::clone(&tracker));

    let result = submissions
        .submit(Submission {
            payload,
            submission_id: submission_id.unwrap_or_else(Uuid::new_v4),
            user_id,
            assessment_id,
        })
        .await;

    queue.stop().await?;
    tracker.close().await?;

    let job = result.context("submission failed")?;
    println!("{}", job.id);
    Ok(())
}

async fn status(config: &Config, job_id: JobId) -> anyhow::Result<()> {
    let tracker = tracker_from_config(&config.storage).await?;
    let record = tracker.record(&job_id).await?;
    tracker.close().await?;

    match record {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("unknown job {job_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_file_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let loaded = dotenvy::from_path(dir.path().join(".env"));
        assert!(ignore_missing(loaded).is_ok());
    }

    #[test]
    fn malformed_env_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "GRADER TEST=1\n").unwrap();
        assert!(ignore_missing(dotenvy::from_path(&path)).is_err());
    }
}
