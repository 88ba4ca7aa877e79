//! Broker seam underneath [`JobQueue`](crate::JobQueue).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

/// Broker-assigned handle for one in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    #[inline]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed out by the broker, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

/// Durable message transport.
///
/// Messages fetched from a topic stay in flight until they are acked or
/// nacked. Anything still in flight when the connection drops or is closed
/// becomes eligible for redelivery.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Hand a message to the broker for delivery to at least one consumer.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next message on `topic`.
    async fn fetch(&self, topic: &str, wait: Duration)
        -> Result<Option<RawDelivery>, BrokerError>;

    /// Confirm processing; removes the message.
    async fn ack(&self, topic: &str, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Reject the message. With `requeue` it becomes ready again, otherwise it
    /// is dead-lettered.
    async fn nack(&self, topic: &str, tag: &DeliveryTag, requeue: bool)
        -> Result<(), BrokerError>;

    /// Re-establish the connection after [`BrokerError::Disconnected`].
    async fn reconnect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Close the connection, releasing every unacked message.
    async fn close(&self) -> Result<(), BrokerError>;
}
