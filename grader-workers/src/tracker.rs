//! Job lifecycle tracking.
//!
//! A [`JobRecord`] moves `Queued -> Running -> Done(outcome)` and never
//! leaves `Done`. Every transition except [`LifecycleTracker::increment_retry`]
//! is idempotent, so redelivered messages converge on the same record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use grader_job_queue::{JobId, JobOutcome};

use crate::error::TrackerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done { outcome: JobOutcome },
}

/// What a lifecycle call did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record changed.
    Applied,
    /// The record was already in the requested state.
    Unchanged,
    /// The job has already finished; the call was ignored.
    Terminal,
}

/// Persisted state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(default)]
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn queued(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            retries: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Done { .. })
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        match &self.state {
            JobState::Done { outcome } => Some(outcome),
            _ => None,
        }
    }

    pub fn start(&mut self) -> Transition {
        match self.state {
            JobState::Queued => {
                self.state = JobState::Running;
                self.touch();
                Transition::Applied
            }
            JobState::Running => Transition::Unchanged,
            JobState::Done { .. } => Transition::Terminal,
        }
    }

    /// Record the outcome. The first terminal outcome wins.
    pub fn finish(&mut self, outcome: JobOutcome) -> Transition {
        match &self.state {
            JobState::Done { outcome: existing } if *existing == outcome => Transition::Unchanged,
            JobState::Done { .. } => Transition::Terminal,
            _ => {
                self.state = JobState::Done { outcome };
                self.touch();
                Transition::Applied
            }
        }
    }

    pub fn bump_retry(&mut self) -> u32 {
        self.retries = self.retries.saturating_add(1);
        self.touch();
        self.retries
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persistence seam for job progress.
///
/// Implementations must make `mark_queued`, `mark_running` and `mark_done`
/// safe to repeat: the queue delivers at least once.
#[async_trait]
pub trait LifecycleTracker: Send + Sync {
    /// Make the record exist. Existing records are left alone.
    async fn mark_queued(&self, id: &JobId) -> Result<(), TrackerError>;

    /// Returns [`Transition::Terminal`] if the job already finished.
    async fn mark_running(&self, id: &JobId) -> Result<Transition, TrackerError>;

    async fn mark_done(&self, id: &JobId, outcome: JobOutcome) -> Result<Transition, TrackerError>;

    /// Count one failed attempt and return the new total.
    async fn increment_retry(&self, id: &JobId) -> Result<u32, TrackerError>;

    async fn record(&self, id: &JobId) -> Result<Option<JobRecord>, TrackerError>;

    /// Flush and release the store. Later calls fail.
    async fn close(&self) -> Result<(), TrackerError>;
}

/// Tracker keeping records in memory.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    records: RwLock<HashMap<JobId, JobRecord>>,
    closed: AtomicBool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), TrackerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TrackerError::Unavailable("tracker is closed".into()))
        } else {
            Ok(())
        }
    }

    async fn update<T>(
        &self,
        id: &JobId,
        apply: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, TrackerError> {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        let record = records
            .entry(id.clone())
            .or_insert_with(|| JobRecord::queued(id.clone()));
        Ok(apply(record))
    }
}

#[async_trait]
impl LifecycleTracker for MemoryTracker {
    async fn mark_queued(&self, id: &JobId) -> Result<(), TrackerError> {
        self.update(id, |_| ()).await
    }

    async fn mark_running(&self, id: &JobId) -> Result<Transition, TrackerError> {
        self.update(id, JobRecord::start).await
    }

    async fn mark_done(&self, id: &JobId, outcome: JobOutcome) -> Result<Transition, TrackerError> {
        self.update(id, |record| record.finish(outcome)).await
    }

    async fn increment_retry(&self, id: &JobId) -> Result<u32, TrackerError> {
        self.update(id, JobRecord::bump_retry).await
    }

    async fn record(&self, id: &JobId) -> Result<Option<JobRecord>, TrackerError> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn close(&self) -> Result<(), TrackerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_state_machine() {
        let mut record = JobRecord::queued(JobId::new("J1"));
        assert_eq!(record.start(), Transition::Applied);
        assert_eq!(record.start(), Transition::Unchanged);
        assert_eq!(record.finish(JobOutcome::graded(100, "")), Transition::Applied);
        assert!(record.is_terminal());
        assert_eq!(record.start(), Transition::Terminal);
        assert_eq!(record.state, JobState::Done { outcome: JobOutcome::graded(100, "") });
    }

    #[test]
    fn test_first_terminal_outcome_wins() {
        let mut record = JobRecord::queued(JobId::new("J1"));
        record.finish(JobOutcome::graded(80, "ok"));
        let before = record.clone();

        assert_eq!(record.finish(JobOutcome::graded(80, "ok")), Transition::Unchanged);
        assert_eq!(record.finish(JobOutcome::failed("late")), Transition::Terminal);
        assert_eq!(record, before);
    }

    #[test]
    fn test_record_json_shape() {
        let mut record = JobRecord::queued(JobId::new("J1"));
        record.finish(JobOutcome::rejected("not a zip"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["job_id"], "J1");
        assert_eq!(value["state"], "done");
        assert_eq!(value["outcome"]["status"], "rejected");

        let back: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_memory_tracker_repeated_calls_are_idempotent() {
        let tracker = MemoryTracker::new();
        let id = JobId::new("J1");

        tracker.mark_queued(&id).await.unwrap();
        tracker.mark_running(&id).await.unwrap();
        tracker.mark_done(&id, JobOutcome::graded(100, "")).await.unwrap();
        let first = tracker.record(&id).await.unwrap().unwrap();

        tracker.mark_queued(&id).await.unwrap();
        assert_eq!(tracker.mark_running(&id).await.unwrap(), Transition::Terminal);
        assert_eq!(
            tracker.mark_done(&id, JobOutcome::graded(100, "")).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(tracker.record(&id).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_memory_tracker_counts_retries() {
        let tracker = MemoryTracker::new();
        let id = JobId::new("J2");
        assert_eq!(tracker.increment_retry(&id).await.unwrap(), 1);
        assert_eq!(tracker.increment_retry(&id).await.unwrap(), 2);
        assert_eq!(tracker.record(&id).await.unwrap().unwrap().retries, 2);
        assert!(tracker.record(&JobId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_tracker_refuses_calls_after_close() {
        let tracker = MemoryTracker::new();
        tracker.close().await.unwrap();
        assert!(matches!(
            tracker.mark_queued(&JobId::new("J1")).await,
            Err(TrackerError::Unavailable(_))
        ));
    }
}
