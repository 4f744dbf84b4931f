//! In-process broker.
//!
//! Implements the [`crate::broker`] contract on top of tokio unbounded mpsc channels: fan-out
//! topics copy each published message into every bound queue, queues buffer until their single
//! consumer reads them. Availability can be toggled to inject broker outages.

use crate::broker::{BrokerChannel, BrokerConnector, BrokerEndpoint, Subscription};
use crate::error::{ReplError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct QueueSlot {
    sender: mpsc::UnboundedSender<Bytes>,
    receiver: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, QueueSlot>,
}

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
struct MemoryBrokerStatsInner {
    connections: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    direct_sends: AtomicU64,
    failed_operations: AtomicU64,
}

/// Statistics of the in-process broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    /// Channels opened.
    pub connections: u64,
    /// Messages published to fan-out topics.
    pub published: u64,
    /// Copies delivered into bound queues by fan-out.
    pub delivered: u64,
    /// Messages sent directly to a queue.
    pub direct_sends: u64,
    /// Operations rejected because the broker was unavailable or the channel closed.
    pub failed_operations: u64,
}

/// In-process broker shared by every connector clone.
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    stats: Arc<MemoryBrokerStatsInner>,
}

impl Clone for MemoryBroker {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            available: Arc::clone(&self.available),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, available broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(MemoryBrokerStatsInner::default()),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "memory broker availability changed");
    }

    /// Whether the broker currently accepts requests.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns true if `queue` exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Names of all existing queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queues currently bound to `topic`.
    pub fn bindings(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> MemoryBrokerStats {
        MemoryBrokerStats {
            connections: self.stats.connections.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            direct_sends: self.stats.direct_sends.load(Ordering::Relaxed),
            failed_operations: self.stats.failed_operations.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn BrokerChannel>> {
        if !self.is_available() {
            self.stats.failed_operations.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::broker(format!("broker {} unreachable", endpoint)));
        }
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

/// Channel into a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    open: AtomicBool,
}

impl MemoryChannel {
    fn check(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            self.broker
                .stats
                .failed_operations
                .fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::broker("channel is closed"));
        }
        if !self.broker.is_available() {
            self.broker
                .stats
                .failed_operations
                .fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::broker("broker connection lost"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_fanout_topic(&self, topic: &str) -> Result<()> {
        self.check()?;
        self.broker
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, bind_to: Option<&str>) -> Result<()> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        if let Some(topic) = bind_to {
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .insert(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.check()?;
        let state = self.broker.state.lock();
        let bound = state
            .topics
            .get(topic)
            .ok_or_else(|| ReplError::broker(format!("topic {} not declared", topic)))?;
        let mut delivered = 0u64;
        for queue in bound {
            if let Some(slot) = state.queues.get(queue) {
                if slot.sender.send(payload.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.broker.stats.published.fetch_add(1, Ordering::Relaxed);
        self.broker
            .stats
            .delivered
            .fetch_add(delivered, Ordering::Relaxed);
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.check()?;
        let state = self.broker.state.lock();
        let slot = state
            .queues
            .get(queue)
            .ok_or_else(|| ReplError::broker(format!("queue {} not declared", queue)))?;
        slot.sender
            .send(payload)
            .map_err(|_| ReplError::broker(format!("queue {} has no consumer", queue)))?;
        self.broker
            .stats
            .direct_sends
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        self.check()?;
        let mut state = self.broker.state.lock();
        let slot = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ReplError::broker(format!("queue {} not declared", queue)))?;
        let receiver = slot
            .receiver
            .take()
            .ok_or_else(|| ReplError::broker(format!("queue {} already has a consumer", queue)))?;
        Ok(Box::new(MemorySubscription { receiver }))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.queues.remove(queue);
        for bound in state.topics.values_mut() {
            bound.remove(queue);
        }
        debug!(queue, "queue deleted");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySubscription {
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        Ok(self.receiver.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("memory", 0)
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.declare_fanout_topic("ops").await.unwrap();
        channel.declare_queue("a", Some("ops")).await.unwrap();
        channel.declare_queue("b", Some("ops")).await.unwrap();
        let mut sub_a = channel.subscribe("a").await.unwrap();
        let mut sub_b = channel.subscribe("b").await.unwrap();

        channel.publish("ops", Bytes::from_static(b"m1")).await.unwrap();
        channel.publish("ops", Bytes::from_static(b"m2")).await.unwrap();

        assert_eq!(sub_a.next_message().await.unwrap().unwrap(), &b"m1"[..]);
        assert_eq!(sub_a.next_message().await.unwrap().unwrap(), &b"m2"[..]);
        assert_eq!(sub_b.next_message().await.unwrap().unwrap(), &b"m1"[..]);

        let stats = broker.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 4);
        assert_eq!(broker.bindings("ops"), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_buffers_before_subscribe() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.declare_queue("load", None).await.unwrap();
        channel
            .send_to_queue("load", Bytes::from_static(b"chunk"))
            .await
            .unwrap();
        let mut sub = channel.subscribe("load").await.unwrap();
        assert_eq!(sub.next_message().await.unwrap().unwrap(), &b"chunk"[..]);
    }

    #[tokio::test]
    async fn test_single_consumer_per_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.declare_queue("q", None).await.unwrap();
        let _first = channel.subscribe("q").await.unwrap();
        assert!(channel.subscribe("q").await.is_err());
        assert!(channel.subscribe("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_queue_ends_stream_and_unbinds() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.declare_queue("q", Some("ops")).await.unwrap();
        let mut sub = channel.subscribe("q").await.unwrap();
        channel.delete_queue("q").await.unwrap();
        assert!(sub.next_message().await.unwrap().is_none());
        assert!(!broker.has_queue("q"));
        assert!(broker.bindings("ops").is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_topic_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        let err = channel
            .publish("nowhere", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Broker { .. }));
    }

    #[tokio::test]
    async fn test_outage_and_recovery() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.declare_fanout_topic("ops").await.unwrap();

        broker.set_available(false);
        assert!(broker.connect(&endpoint()).await.is_err());
        assert!(channel.publish("ops", Bytes::new()).await.is_err());

        broker.set_available(true);
        channel.publish("ops", Bytes::new()).await.unwrap();
        assert_eq!(broker.stats().failed_operations, 2);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_calls() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&endpoint()).await.unwrap();
        channel.close().await.unwrap();
        assert!(channel.declare_fanout_topic("ops").await.is_err());
        assert_eq!(broker.stats().connections, 1);
    }
}
