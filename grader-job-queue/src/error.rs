//! Error types for the job queue system.

use thiserror::Error;

use crate::broker::DeliveryTag;

/// Errors reported by a [`Broker`](crate::Broker) implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection lost")]
    Disconnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Backend(String),
}

impl BrokerError {
    /// Returns true if reconnecting may clear the error.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Io(_))
    }
}

/// Publishing a job failed. Delivery may still have happened if the broker
/// acknowledged the message just before a network fault.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to hand job to broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("job queue is stopped")]
    Stopped,
}

/// A message body could not be turned back into a job.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed job envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported job envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected envelope kind: {0}")]
    UnexpectedKind(String),
}

/// Errors that may occur while interacting with the job queue.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("consume failed: {0}")]
    Consume(#[source] BrokerError),

    #[error("failed to settle delivery: {0}")]
    Settle(#[source] BrokerError),

    #[error("job queue is already stopped")]
    AlreadyStopped,
}
