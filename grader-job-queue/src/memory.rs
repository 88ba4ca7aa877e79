//! In-process broker.
//!
//! Lets producers and consumers running in the same process be wired
//! together without provisioning real queue infrastructure. Also used by the
//! test suites, which is why it exposes counters and a fault hook.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, DeliveryTag, RawDelivery};
use crate::error::BrokerError;

/// Counters for one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub ready: usize,
    pub in_flight: usize,
    pub published: usize,
    pub delivered: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<Vec<u8>>,
    in_flight: HashMap<DeliveryTag, Vec<u8>>,
    dead: Vec<Vec<u8>>,
    stats: TopicStats,
}

impl Topic {
    /// Put every unacked message back at the front of the ready queue.
    fn release_in_flight(&mut self) {
        let mut released: Vec<_> = self.in_flight.drain().collect();
        released.sort_by(|a, b| b.0.as_str().cmp(a.0.as_str()));
        for (_, body) in released {
            self.ready.push_front(body);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    next_tag: u64,
    disconnected: bool,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else if self.disconnected {
            Err(BrokerError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn claim(&mut self, topic: &str) -> Option<RawDelivery> {
        self.next_tag += 1;
        let tag = DeliveryTag::new(format!("{topic}#{:012}", self.next_tag));
        let topic = self.topics.get_mut(topic)?;
        let body = topic.ready.pop_front()?;
        topic.in_flight.insert(tag.clone(), body.clone());
        topic.stats.delivered += 1;
        Some(RawDelivery { tag, body })
    }

    fn release_all(&mut self) {
        for topic in self.topics.values_mut() {
            topic.release_in_flight();
        }
    }
}

/// Broker keeping every topic in memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    available: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Backend("memory broker state poisoned".into()))
    }

    /// Snapshot of the counters for `topic`.
    pub fn stats(&self, topic: &str) -> TopicStats {
        match self.lock() {
            Ok(state) => state
                .topics
                .get(topic)
                .map(|t| TopicStats {
                    ready: t.ready.len(),
                    in_flight: t.in_flight.len(),
                    ..t.stats
                })
                .unwrap_or_default(),
            Err(_) => TopicStats::default(),
        }
    }

    /// Bodies of messages nacked without requeue.
    pub fn dead_letters(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .ok()
            .and_then(|state| state.topics.get(topic).map(|t| t.dead.clone()))
            .unwrap_or_default()
    }

    /// Simulate a dropped connection: unacked messages are released and every
    /// call fails with [`BrokerError::Disconnected`] until [`Broker::reconnect`].
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.lock() {
            state.disconnected = true;
            state.release_all();
        }
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn settle(
        &self,
        topic: &str,
        tag: &DeliveryTag,
        settle: impl FnOnce(&mut Topic, Vec<u8>),
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let topic = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;
        let body = topic
            .in_flight
            .remove(tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;
        settle(topic, body);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            state.ensure_open()?;
            let topic = state.topics.entry(topic.to_owned()).or_default();
            topic.ready.push_back(body);
            topic.stats.published += 1;
        }
        self.available.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        wait: Duration,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register before checking so a publish in between is not missed.
            let notified = self.available.notified();
            {
                let mut state = self.lock()?;
                state.ensure_open()?;
                if let Some(delivery) = state.claim(topic) {
                    return Ok(Some(delivery));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, topic: &str, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.settle(topic, tag, |topic, _| topic.stats.acked += 1)
    }

    async fn nack(
        &self,
        topic: &str,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.settle(topic, tag, |topic, body| {
            if requeue {
                topic.stats.requeued += 1;
                topic.ready.push_back(body);
            } else {
                topic.stats.dead_lettered += 1;
                topic.dead.push(body);
            }
        })?;
        if requeue {
            self.available.notify_waiters();
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.disconnected = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            state.closed = true;
            state.release_all();
        }
        self.available.notify_waiters();
        Ok(())
    }
}
