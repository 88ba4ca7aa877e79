//! Bounded pool of executors consuming the job queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use grader_job_queue::{
    Acker, Backoff, Consumer, Delivery, JobId, JobOutcome, JobQueue, JobQueueError,
};

use crate::error::{PoolError, TrackerError};
use crate::grading::GradeFn;
use crate::tracker::{LifecycleTracker, Transition};

/// Reason recorded when a job runs out of attempts.
pub const RETRY_LIMIT_EXCEEDED: &str = "retry limit exceeded";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Failed attempts tolerated before a job is dead-lettered.
    pub retry_limit: u32,
    /// How long `stop` waits for running jobs before abandoning them.
    pub shutdown_timeout: Duration,
    pub tracker_attempts: u32,
    pub tracker_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            shutdown_timeout: Duration::from_secs(30),
            tracker_attempts: 3,
            tracker_backoff: Duration::from_millis(100),
        }
    }
}

/// Default executor count: twice the available parallelism.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub concurrency: usize,
    pub active: usize,
    pub graded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    concurrency: AtomicUsize,
    active: AtomicUsize,
    graded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn record_outcome(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Graded { .. } => &self.graded,
            JobOutcome::Failed { .. } => &self.failed,
            JobOutcome::Rejected { .. } => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            concurrency: self.concurrency.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            graded: self.graded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Phase {
    Idle,
    Running {
        intake: CancellationToken,
        abandon: CancellationToken,
        executors: JoinSet<()>,
    },
    Stopped,
}

/// State shared by every executor task.
struct Worker {
    tracker: Arc<dyn LifecycleTracker>,
    grade: GradeFn,
    config: PoolConfig,
    counters: Counters,
}

/// Runs up to `concurrency` grading calls at once over one queue.
pub struct WorkerPool {
    queue: JobQueue,
    worker: Arc<Worker>,
    shutdown: CancellationToken,
    phase: Mutex<Phase>,
    running: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("config", &self.worker.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        tracker: Arc<dyn LifecycleTracker>,
        grade: GradeFn,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            worker: Arc::new(Worker {
                tracker,
                grade,
                config,
                counters: Counters::default(),
            }),
            shutdown: CancellationToken::new(),
            phase: Mutex::new(Phase::Idle),
            running: AtomicBool::new(false),
        }
    }

    /// Stop pulling new jobs as soon as `token` is cancelled.
    ///
    /// Running jobs are unaffected; [`WorkerPool::stop`] still has to be
    /// called to wait for them.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        self.worker.counters.snapshot()
    }

    /// Spawn `concurrency` executors over the queue's delivery sequence.
    pub async fn start(&self, concurrency: usize) -> Result<(), PoolError> {
        if concurrency == 0 {
            return Err(PoolError::InvalidConcurrency);
        }
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Idle => {}
            Phase::Running { .. } => return Err(PoolError::AlreadyStarted),
            Phase::Stopped => return Err(PoolError::AlreadyStopped),
        }

        let consumer = self.queue.consume().await?;
        let intake = self.shutdown.child_token();
        let abandon = CancellationToken::new();
        let mut executors = JoinSet::new();
        for index in 0..concurrency {
            executors.spawn(run_executor(
                index,
                Arc::clone(&self.worker),
                consumer.clone(),
                intake.clone(),
                abandon.clone(),
            ));
        }

        self.worker
            .counters
            .concurrency
            .store(concurrency, Ordering::Relaxed);
        *phase = Phase::Running {
            intake,
            abandon,
            executors,
        };
        self.running.store(true, Ordering::Release);
        info!(
            concurrency,
            topic = %self.queue.topic(),
            retry_limit = self.worker.config.retry_limit,
            "worker pool started"
        );
        Ok(())
    }

    /// Stop intake and wait for executors.
    ///
    /// Jobs still running after `shutdown_timeout` are abandoned: their
    /// deliveries are dropped unacked and will be redelivered.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let mut phase = self.phase.lock().await;
        let (intake, abandon, mut executors) = match std::mem::replace(&mut *phase, Phase::Stopped)
        {
            Phase::Running {
                intake,
                abandon,
                executors,
            } => (intake, abandon, executors),
            Phase::Idle => {
                *phase = Phase::Idle;
                return Err(PoolError::NotStarted);
            }
            Phase::Stopped => return Err(PoolError::AlreadyStopped),
        };
        self.running.store(false, Ordering::Release);

        info!(active = self.stats().active, "stopping worker pool");
        intake.cancel();

        let timeout = self.worker.config.shutdown_timeout;
        if tokio::time::timeout(timeout, join_all(&mut executors))
            .await
            .is_err()
        {
            warn!(
                active = self.stats().active,
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timeout elapsed, abandoning running jobs"
            );
            abandon.cancel();
            join_all(&mut executors).await;
        }

        let stats = self.stats();
        info!(
            graded = stats.graded,
            failed = stats.failed,
            rejected = stats.rejected,
            dead_lettered = stats.dead_lettered,
            abandoned = stats.abandoned,
            "worker pool stopped"
        );
        Ok(())
    }
}

async fn join_all(executors: &mut JoinSet<()>) {
    while let Some(joined) = executors.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "executor task failed");
        }
    }
}

async fn run_executor(
    index: usize,
    worker: Arc<Worker>,
    consumer: Consumer,
    intake: CancellationToken,
    abandon: CancellationToken,
) {
    debug!(executor = index, "executor started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = intake.cancelled() => break,
            next = consumer.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let job_id = delivery.job.id.clone();
        let _active = ActiveGuard::enter(&worker.counters.active);
        tokio::select! {
            _ = abandon.cancelled() => {
                worker.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(executor = index, job_id = %job_id, "abandoned job at shutdown, left unacked");
                break;
            }
            _ = worker.process(delivery) => {}
        }
    }
    debug!(executor = index, "executor exited");
}

impl Worker {
    async fn process(&self, delivery: Delivery) {
        let Delivery { job, acker } = delivery;
        let id = job.id.clone();
        debug!(
            job_id = %id,
            tag = %acker.tag(),
            artifact = %job.artifact_ref,
            age_ms = job.age().num_milliseconds(),
            "dequeued job"
        );

        if let Err(e) = self.tracked("mark_queued", &id, || self.tracker.mark_queued(&id)).await {
            return release(acker, &id, e).await;
        }
        match self.tracked("mark_running", &id, || self.tracker.mark_running(&id)).await {
            Ok(Transition::Terminal) => {
                info!(job_id = %id, "job already finished, acking duplicate delivery");
                return settle(&id, "ack", acker.ack().await);
            }
            Ok(_) => {}
            Err(e) => return release(acker, &id, e).await,
        }

        match (self.grade)(job).await {
            Ok(outcome) => {
                let done = self
                    .tracked("mark_done", &id, || self.tracker.mark_done(&id, outcome.clone()))
                    .await;
                if let Err(e) = done {
                    return release(acker, &id, e).await;
                }
                self.counters.record_outcome(&outcome);
                info!(job_id = %id, outcome = %outcome, "job finished");
                settle(&id, "ack", acker.ack().await);
            }
            Err(grading_error) => {
                let attempts = match self
                    .tracked("increment_retry", &id, || self.tracker.increment_retry(&id))
                    .await
                {
                    Ok(attempts) => attempts,
                    Err(e) => return release(acker, &id, e).await,
                };
                let limit = self.config.retry_limit;
                if attempts <= limit {
                    warn!(
                        job_id = %id,
                        error = %grading_error,
                        attempt = attempts,
                        retry_limit = limit,
                        "grading failed, requeueing"
                    );
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    return settle(&id, "nack", acker.nack(true).await);
                }

                let outcome = JobOutcome::failed(RETRY_LIMIT_EXCEEDED);
                let done = self
                    .tracked("mark_done", &id, || self.tracker.mark_done(&id, outcome.clone()))
                    .await;
                if let Err(e) = done {
                    return release(acker, &id, e).await;
                }
                error!(
                    job_id = %id,
                    error = %grading_error,
                    attempts,
                    "retry limit exceeded, dead-lettering job"
                );
                self.counters.record_outcome(&outcome);
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                settle(&id, "nack", acker.nack(false).await);
            }
        }
    }

    /// Run a tracker call, retrying with backoff on failure.
    async fn tracked<T, F, Fut>(&self, op: &'static str, id: &JobId, call: F) -> Result<T, TrackerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let backoff_base = self.config.tracker_backoff;
        let mut backoff = Backoff::new(backoff_base, backoff_base.saturating_mul(8));
        let attempts = self.config.tracker_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        job_id = %id,
                        op,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "tracker call failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Give a job back to the queue after an infrastructure failure, without
/// spending one of its retries.
async fn release(acker: Acker, id: &JobId, cause: TrackerError) {
    error!(job_id = %id, error = %cause, "tracker unavailable, requeueing job");
    settle(id, "nack", acker.nack(true).await);
}

fn settle(id: &JobId, action: &'static str, result: Result<(), JobQueueError>) {
    match result {
        Ok(()) => debug!(job_id = %id, action, "settled delivery"),
        Err(e) => warn!(job_id = %id, action, error = %e, "failed to settle delivery, it will be redelivered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_default_concurrency_is_positive_and_even() {
        let n = default_concurrency();
        assert!(n >= 2);
        assert_eq!(n % 2, 0);
    }

    #[test]
    fn test_outcome_counters() {
        let counters = Counters::default();
        counters.record_outcome(&JobOutcome::graded(1, ""));
        counters.record_outcome(&JobOutcome::rejected("bad"));
        counters.record_outcome(&JobOutcome::rejected("worse"));
        let stats = counters.snapshot();
        assert_eq!(stats.graded, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.failed, 0);
    }
}
