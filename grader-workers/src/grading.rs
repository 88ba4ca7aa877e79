//! The grading capability injected into the pool.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use grader_job_queue::{Job, JobOutcome};

use crate::error::GradingError;

/// Runs one job to an outcome.
///
/// `Ok` is terminal, whatever the outcome. `Err` means the attempt should be
/// retried.
pub type GradeFn =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<JobOutcome, GradingError>> + Send + Sync>;

/// Wrap an async closure as a [`GradeFn`].
///
/// ```rust
/// use grader_workers::{grade_fn, GradeFn};
/// use grader_job_queue::JobOutcome;
///
/// let grade: GradeFn = grade_fn(|_job| async move { Ok(JobOutcome::graded(100, "")) });
/// ```
pub fn grade_fn<F, Fut>(f: F) -> GradeFn
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutcome, GradingError>> + Send + 'static,
{
    Arc::new(move |job| -> BoxFuture<'static, Result<JobOutcome, GradingError>> {
        Box::pin(f(job))
    })
}
