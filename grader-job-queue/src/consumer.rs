//! Consumer side of the queue: the shared delivery sequence and ack handles.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::broker::{Broker, DeliveryTag};
use crate::error::JobQueueError;
use crate::types::Job;

/// Count of deliveries fetched from the broker and not yet settled.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn track(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolve once nothing is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.get() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Decrements the in-flight count when dropped, settled or not.
#[derive(Debug)]
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Settles exactly one delivery.
///
/// `ack` and `nack` consume the handle. Dropping it unsettled leaves the
/// message unacked, so the broker redelivers it after the connection closes
/// or the claim expires.
pub struct Acker {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    tag: DeliveryTag,
    _guard: InFlightGuard,
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("topic", &self.topic)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Acker {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        topic: Arc<str>,
        tag: DeliveryTag,
        guard: InFlightGuard,
    ) -> Self {
        Self {
            broker,
            topic,
            tag,
            _guard: guard,
        }
    }

    #[inline]
    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    /// Confirm successful processing.
    pub async fn ack(self) -> Result<(), JobQueueError> {
        self.broker
            .ack(&self.topic, &self.tag)
            .await
            .map_err(JobQueueError::Settle)
    }

    /// Signal failure, optionally asking for redelivery.
    pub async fn nack(self, requeue: bool) -> Result<(), JobQueueError> {
        self.broker
            .nack(&self.topic, &self.tag, requeue)
            .await
            .map_err(JobQueueError::Settle)
    }
}

/// A job paired with the handle that settles it.
#[derive(Debug)]
pub struct Delivery {
    pub job: Job,
    pub acker: Acker,
}

/// Handle onto the queue's shared delivery sequence.
///
/// Clones share one channel: every delivery goes to exactly one caller of
/// [`Consumer::next`].
#[derive(Debug, Clone)]
pub struct Consumer {
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
}

impl Consumer {
    pub(crate) fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the queue has stopped and every message already
    /// taken from the broker has been handed out.
    pub async fn next(&self) -> Option<Delivery> {
        self.rx.lock().await.recv().await
    }
}
