//! Job queue handle shared by publishers and the worker pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::broker::{Broker, RawDelivery};
use crate::consumer::{Acker, Consumer, Delivery, InFlight};
use crate::error::{BrokerError, JobQueueError, PublishError};
use crate::types::{decode_job, encode_job, Job};

/// Default topic carrying grading jobs.
pub const DEFAULT_TOPIC: &str = "grader-submissions";

/// Settings for a [`JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub topic: String,
    /// How long one broker fetch waits before the feeder re-checks for stop.
    pub poll_wait: Duration,
    /// Deliveries buffered between the broker and the executors.
    pub prefetch: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Upper bound on how long `stop` waits for outstanding deliveries.
    pub drain_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            poll_wait: Duration::from_millis(500),
            prefetch: 16,
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

struct Feeder {
    handle: JoinHandle<()>,
    consumer: Consumer,
}

struct Shared {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    options: QueueOptions,
    in_flight: Arc<InFlight>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    feeder: Mutex<Option<Feeder>>,
}

/// Process-wide connection to the job broker.
///
/// Clones share the same connection and the same stop state.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("topic", &self.shared.topic)
            .field("stopped", &self.is_stopped())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl JobQueue {
    pub fn new(broker: Arc<dyn Broker>, options: QueueOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                topic: Arc::from(options.topic.as_str()),
                options,
                in_flight: Arc::new(InFlight::default()),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                feeder: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Deliveries taken from the broker and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.get()
    }

    /// Serialize `job` and hand it to the broker.
    ///
    /// On error the caller must not assume the job was *not* delivered: the
    /// broker may have accepted it just before the failure surfaced.
    pub async fn publish(&self, job: &Job) -> Result<(), PublishError> {
        if self.is_stopped() {
            return Err(PublishError::Stopped);
        }
        let body = encode_job(job)?;
        self.shared.broker.publish(&self.shared.topic, body).await?;
        debug!(job_id = %job.id, topic = %self.shared.topic, "published job");
        Ok(())
    }

    /// Join the delivery sequence.
    ///
    /// The first call starts the background feeder; later calls return
    /// handles onto the same sequence.
    pub async fn consume(&self) -> Result<Consumer, JobQueueError> {
        if self.is_stopped() {
            return Err(JobQueueError::AlreadyStopped);
        }
        let mut feeder = self.shared.feeder.lock().await;
        // `stop` flips the flag before taking the feeder slot.
        if self.is_stopped() {
            return Err(JobQueueError::AlreadyStopped);
        }
        if let Some(existing) = feeder.as_ref() {
            return Ok(existing.consumer.clone());
        }

        let (tx, rx) = mpsc::channel(self.shared.options.prefetch.max(1));
        let consumer = Consumer::new(rx);
        let handle = tokio::spawn(feed(Arc::clone(&self.shared), tx));
        *feeder = Some(Feeder {
            handle,
            consumer: consumer.clone(),
        });
        info!(topic = %self.shared.topic, "started consuming");
        Ok(consumer)
    }

    /// Stop consuming and close the broker connection.
    ///
    /// New deliveries stop immediately. Deliveries already handed out get up
    /// to `drain_timeout` to be settled; whatever is still unacked after that
    /// is released back to the broker for redelivery.
    pub async fn stop(&self) -> Result<(), JobQueueError> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Err(JobQueueError::AlreadyStopped);
        }
        self.shared.shutdown.cancel();

        let feeder = self.shared.feeder.lock().await.take();
        if let Some(Feeder { handle, consumer }) = feeder {
            if let Err(e) = handle.await {
                error!(error = %e, "job feeder task failed");
            }
            // Buffered deliveries nobody else is waiting for are dropped
            // here, which releases them.
            drop(consumer);
        }

        let drain = self.shared.options.drain_timeout;
        if tokio::time::timeout(drain, self.shared.in_flight.wait_idle())
            .await
            .is_err()
        {
            warn!(
                unsettled = self.in_flight(),
                timeout_ms = drain.as_millis() as u64,
                "deliveries still unsettled at stop, leaving them for redelivery"
            );
        }

        if let Err(e) = self.shared.broker.close().await {
            warn!(error = %e, "failed to close broker connection cleanly");
        }
        info!(topic = %self.shared.topic, "job queue stopped");
        Ok(())
    }
}

/// Pull from the broker and forward into the delivery channel until stopped.
async fn feed(shared: Arc<Shared>, tx: mpsc::Sender<Delivery>) {
    let options = &shared.options;
    let mut backoff = Backoff::new(options.reconnect_initial, options.reconnect_max);

    loop {
        let fetched = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            fetched = shared.broker.fetch(&shared.topic, options.poll_wait) => fetched,
        };

        match fetched {
            Ok(Some(raw)) => {
                backoff.reset();
                let Some(delivery) = decode_delivery(&shared, raw).await else {
                    continue;
                };
                tokio::select! {
                    // Dropping the pending delivery leaves it unacked.
                    _ = shared.shutdown.cancelled() => break,
                    sent = tx.send(delivery) => {
                        if sent.is_err() {
                            debug!("all consumers gone, feeder exiting");
                            break;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(BrokerError::Closed) => {
                warn!(topic = %shared.topic, "broker closed underneath the feeder");
                break;
            }
            Err(e) => {
                let transient = e.is_transient();
                let err = JobQueueError::Consume(e);
                let delay = backoff.next_delay();
                warn!(
                    error = %err,
                    transient,
                    retry_in_ms = delay.as_millis() as u64,
                    "consume error, backing off"
                );
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if transient {
                    match shared.broker.reconnect().await {
                        Ok(()) => info!(topic = %shared.topic, "broker connection re-established"),
                        Err(e) => warn!(error = %e, "reconnect attempt failed"),
                    }
                }
            }
        }
    }
    debug!(topic = %shared.topic, "job feeder stopped");
}

/// Decode a raw message; undecodable messages are dead-lettered on the spot.
async fn decode_delivery(shared: &Arc<Shared>, raw: RawDelivery) -> Option<Delivery> {
    let guard = shared.in_flight.track();
    match decode_job(&raw.body) {
        Ok(job) => Some(Delivery {
            job,
            acker: Acker::new(
                Arc::clone(&shared.broker),
                Arc::clone(&shared.topic),
                raw.tag,
                guard,
            ),
        }),
        Err(e) => {
            error!(tag = %raw.tag, error = %e, "undecodable message, dead-lettering");
            if let Err(e) = shared.broker.nack(&shared.topic, &raw.tag, false).await {
                warn!(tag = %raw.tag, error = %e, "failed to dead-letter undecodable message");
            }
            None
        }
    }
}
