use thiserror::Error;

use grader_job_queue::{ArtifactRef, JobQueueError, PublishError};
use grader_workers::{PoolError, TrackerError};

/// Artifact storage failures.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactRef),
    #[error("unsupported artifact reference: {0}")]
    InvalidRef(ArtifactRef),
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A submission could not be turned into a queued job.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("failed to store artifact: {0}")]
    Artifact(#[from] ArtifactError),
    /// The submission attempt failed; the broker may still have taken the job.
    #[error("failed to publish job: {0}")]
    Publish(#[from] PublishError),
}

/// Errors raised while starting or stopping the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] grader_config::ConfigError),
    #[error("grading.command must be set to run workers")]
    NoGrader,
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("artifact store error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("job queue error: {0}")]
    Queue(#[from] JobQueueError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
