//! Worker pool and job lifecycle tracking for the grader pipeline.
//!
//! The [`WorkerPool`] pulls deliveries from a
//! [`JobQueue`](grader_job_queue::JobQueue), runs the injected [`GradeFn`]
//! with at most `concurrency` calls in flight, records progress through a
//! [`LifecycleTracker`] and acks or nacks each delivery.
//!
//! Per delivery, in order: `mark_queued`, `mark_running`, grade,
//! `mark_done`, ack. A grading error is counted with `increment_retry` and
//! requeued until `retry_limit` is exceeded, after which the job is marked
//! `Failed("retry limit exceeded")` and dead-lettered.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use grader_job_queue::{JobOutcome, JobQueue, MemoryBroker, QueueOptions};
//! use grader_workers::{grade_fn, MemoryTracker, PoolConfig, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = JobQueue::new(Arc::new(MemoryBroker::new()), QueueOptions::default());
//!     let pool = WorkerPool::new(
//!         queue.clone(),
//!         Arc::new(MemoryTracker::new()),
//!         grade_fn(|_job| async move { Ok(JobOutcome::graded(100, "")) }),
//!         PoolConfig::default(),
//!     );
//!     pool.start(4).await.unwrap();
//!     // ...
//!     pool.stop().await.unwrap();
//!     queue.stop().await.unwrap();
//! }
//! ```

mod error;
mod file_tracker;
mod grading;
mod pool;
mod tracker;

pub use error::{GradingError, PoolError, TrackerError};
pub use file_tracker::FileTracker;
pub use grading::{grade_fn, GradeFn};
pub use pool::{default_concurrency, PoolConfig, PoolStats, WorkerPool, RETRY_LIMIT_EXCEEDED};
pub use tracker::{JobRecord, JobState, LifecycleTracker, MemoryTracker, Transition};
