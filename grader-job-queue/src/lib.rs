//! Job queue abstraction for the grader pipeline.
//!
//! Producers publish [`Job`]s onto a topic; the worker pool consumes them as
//! [`Delivery`] values and settles each one through its [`Acker`]. Delivery
//! is at-least-once: anything not acked is redelivered, either after the
//! connection closes or after the broker's claim on it expires.
//!
//! # Architecture
//!
//! - [`Broker`] - Transport seam: publish, fetch, ack and nack raw bodies
//! - [`MemoryBroker`] - In-process broker for single-process setups and tests
//! - [`SpoolBroker`] - Directory-backed broker shared between processes
//! - [`JobQueue`] - Versioned job envelope, reconnecting consumer, drain on stop
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use grader_job_queue::{ArtifactRef, Job, JobQueue, MemoryBroker, QueueOptions};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = JobQueue::new(Arc::new(MemoryBroker::new()), QueueOptions::default());
//!
//!     let job = Job::new(
//!         ArtifactRef::new("sha256:0f1e"),
//!         Uuid::new_v4(),
//!         Uuid::new_v4(),
//!         Uuid::new_v4(),
//!     );
//!     queue.publish(&job).await.unwrap();
//!
//!     let consumer = queue.consume().await.unwrap();
//!     if let Some(delivery) = consumer.next().await {
//!         println!("grading {}", delivery.job.id);
//!         delivery.acker.ack().await.unwrap();
//!     }
//!     queue.stop().await.unwrap();
//! }
//! ```

mod backoff;
mod broker;
mod consumer;
mod error;
mod memory;
mod queue;
mod spool;
mod types;

pub use backoff::Backoff;
pub use broker::{Broker, DeliveryTag, RawDelivery};
pub use consumer::{Acker, Consumer, Delivery};
pub use error::{BrokerError, DecodeError, JobQueueError, PublishError};
pub use memory::{MemoryBroker, TopicStats};
pub use queue::{JobQueue, QueueOptions, DEFAULT_TOPIC};
pub use spool::{SpoolBroker, SpoolOptions};
pub use types::{
    decode_job, encode_job, ArtifactRef, Job, JobId, JobOutcome, ENVELOPE_VERSION, JOB_KIND,
};

// Re-export async_trait for convenience when implementing Broker
pub use async_trait::async_trait;
