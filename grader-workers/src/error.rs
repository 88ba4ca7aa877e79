//! Worker-side errors.

use thiserror::Error;

use grader_job_queue::{JobId, JobQueueError};

/// The grading function could not produce an outcome.
///
/// Always treated as transient: the job is requeued until its retry budget
/// runs out.
#[derive(Debug, Error)]
pub enum GradingError {
    #[error("artifact unavailable: {0}")]
    Artifact(String),

    #[error("grader failed: {0}")]
    Failed(String),

    #[error("grader timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a [`LifecycleTracker`](crate::LifecycleTracker) store.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker store unavailable: {0}")]
    Unavailable(String),

    #[error("tracker io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record for job {job_id}: {source}")]
    Corrupt {
        job_id: JobId,
        #[source]
        source: serde_json::Error,
    },
}

/// Misuse of the worker pool lifecycle.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("worker pool was never started")]
    NotStarted,

    #[error("worker pool already stopped")]
    AlreadyStopped,

    #[error(transparent)]
    Queue(#[from] JobQueueError),
}
