#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grader_job_queue::{ArtifactRef, Job, JobId, JobOutcome, JobQueue, MemoryBroker, QueueOptions};
use grader_workers::{JobRecord, LifecycleTracker, MemoryTracker, PoolConfig, TrackerError, Transition};
use uuid::Uuid;

/// Tracker that logs every call and can be told to fail `mark_running`.
#[derive(Default)]
pub struct RecordingTracker {
    inner: MemoryTracker,
    calls: Mutex<Vec<(String, String)>>,
    fail_running: AtomicU32,
}

impl RecordingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` `mark_running` calls.
    pub fn fail_running(&self, n: u32) {
        self.fail_running.store(n, Ordering::SeqCst);
    }

    pub fn calls_for(&self, id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| job == id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn log(&self, id: &JobId, call: String) {
        self.calls.lock().unwrap().push((id.to_string(), call));
    }
}

#[async_trait]
impl LifecycleTracker for RecordingTracker {
    async fn mark_queued(&self, id: &JobId) -> Result<(), TrackerError> {
        self.log(id, "mark_queued".into());
        self.inner.mark_queued(id).await
    }

    async fn mark_running(&self, id: &JobId) -> Result<Transition, TrackerError> {
        let remaining = self.fail_running.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_running.store(remaining - 1, Ordering::SeqCst);
            return Err(TrackerError::Unavailable("injected".into()));
        }
        self.log(id, "mark_running".into());
        self.inner.mark_running(id).await
    }

    async fn mark_done(&self, id: &JobId, outcome: JobOutcome) -> Result<Transition, TrackerError> {
        self.log(id, format!("mark_done({outcome})"));
        self.inner.mark_done(id, outcome).await
    }

    async fn increment_retry(&self, id: &JobId) -> Result<u32, TrackerError> {
        self.log(id, "increment_retry".into());
        self.inner.increment_retry(id).await
    }

    async fn record(&self, id: &JobId) -> Result<Option<JobRecord>, TrackerError> {
        self.inner.record(id).await
    }

    async fn close(&self) -> Result<(), TrackerError> {
        self.inner.close().await
    }
}

pub fn job(id: &str) -> Job {
    Job::with_id(
        id,
        ArtifactRef::new(format!("s3://bucket/{id}")),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    )
}

pub fn queue(broker: &Arc<MemoryBroker>) -> JobQueue {
    JobQueue::new(
        broker.clone(),
        QueueOptions {
            poll_wait: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(200),
            ..QueueOptions::default()
        },
    )
}

pub fn pool_config() -> PoolConfig {
    PoolConfig {
        retry_limit: 3,
        shutdown_timeout: Duration::from_secs(2),
        tracker_attempts: 2,
        tracker_backoff: Duration::from_millis(5),
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
