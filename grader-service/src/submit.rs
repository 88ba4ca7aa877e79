//! Producer side: turn an uploaded submission into a queued job.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use grader_job_queue::{Job, JobQueue};
use grader_workers::LifecycleTracker;

use crate::artifacts::ArtifactStore;
use crate::error::SubmitError;

#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: Vec<u8>,
    pub submission_id: Uuid,
    pub user_id: Uuid,
    pub assessment_id: Uuid,
}

#[derive(Clone)]
pub struct SubmissionService {
    artifacts: Arc<dyn ArtifactStore>,
    queue: JobQueue,
    tracker: Arc<dyn LifecycleTracker>,
}

impl SubmissionService {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        queue: JobQueue,
        tracker: Arc<dyn LifecycleTracker>,
    ) -> Self {
        Self {
            artifacts,
            queue,
            tracker,
        }
    }

    /// Store the payload and publish a job for it.
    ///
    /// A publish error fails the submission. Recording the queued state
    /// afterwards is best effort: the worker creates the record anyway.
    pub async fn submit(&self, submission: Submission) -> Result<Job, SubmitError> {
        let artifact_ref = self.artifacts.put(&submission.payload).await?;
        let job = Job::new(
            artifact_ref,
            submission.submission_id,
            submission.user_id,
            submission.assessment_id,
        );

        if let Err(e) = self.queue.publish(&job).await {
            error!(
                job_id = %job.id,
                submission_id = %job.submission_id,
                error = %e,
                "failed to publish grading job"
            );
            return Err(SubmitError::Publish(e));
        }

        if let Err(e) = self.tracker.mark_queued(&job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to record queued job");
        }
        info!(
            job_id = %job.id,
            submission_id = %job.submission_id,
            artifact = %job.artifact_ref,
            "submission queued for grading"
        );
        Ok(job)
    }
}
