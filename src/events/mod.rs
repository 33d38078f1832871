//! In-process topic bus
//!
//! Carries [`BusEvent`]s between the HTTP layer, the worker pool and
//! telemetry sinks. Subscribers register for the topics they consume, so
//! the orchestrator is not woken for telemetry chatter; publish counts are
//! kept per topic for the status surface. Swapping in an external broker
//! means replacing this module, not its callers.

pub mod types;

pub use types::BusEvent;

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Ring-buffer size of the underlying channel. Sized for bursts of session
/// churn; a subscriber that falls further behind than this sees `Lagged`.
const DEFAULT_CAPACITY: usize = 1024;

/// Topic bus for session lifecycle and telemetry events
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    /// Events published per topic since process start
    published: Mutex<BTreeMap<&'static str, u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            published: Mutex::new(BTreeMap::new()),
        }
    }

    /// Publish an event.
    ///
    /// Fire-and-forget: the publish is counted against its topic whether or
    /// not anyone is listening, and an idle bus simply drops the event.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        *self.published.lock().entry(topic).or_insert(0) += 1;

        match self.tx.send(event) {
            Ok(receivers) => tracing::trace!(topic, receivers, "bus publish"),
            Err(_) => tracing::trace!(topic, "bus publish with no subscribers"),
        }
    }

    /// Subscribe to every topic
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: None,
        }
    }

    /// Subscribe to a fixed set of topics; events on other topics are
    /// skipped without waking the consumer's logic
    pub fn subscribe_topics(&self, topics: &[&'static str]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: Some(topics.iter().copied().collect()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Per-topic publish counters since process start
    pub fn topic_counts(&self) -> BTreeMap<&'static str, u64> {
        self.published.lock().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A (possibly topic-filtered) subscription to the bus
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    topics: Option<HashSet<&'static str>>,
}

impl Subscription {
    /// Next event matching this subscription's topics.
    ///
    /// Lag and closure surface as the underlying [`broadcast`] errors;
    /// filtered-out events are consumed silently.
    pub async fn recv(&mut self) -> Result<BusEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            match &self.topics {
                Some(topics) if !topics.contains(event.topic()) => continue,
                _ => return Ok(event),
            }
        }
    }
}
