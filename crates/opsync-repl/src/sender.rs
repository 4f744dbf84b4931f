//! Broker link of the master and the single sender loop that drains the send queue.
//!
//! The loop publishes one job at a time. A failed publish is retried with the same job after
//! the retry interval and a fresh channel, indefinitely, so the stream never skips a block.

use crate::broker::{BrokerChannel, BrokerConnector, BrokerEndpoint};
use crate::error::{ReplError, Result};
use crate::registry::ReplicaRegistry;
use crate::send_queue::SendQueue;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The master's channel to the fan-out topic. Open while at least one replica is registered.
pub struct MasterLink {
    connector: Arc<dyn BrokerConnector>,
    endpoint: BrokerEndpoint,
    topic: String,
    channel: tokio::sync::Mutex<Option<Box<dyn BrokerChannel>>>,
    active: AtomicBool,
}

impl MasterLink {
    /// Create a closed link.
    pub fn new(connector: Arc<dyn BrokerConnector>, endpoint: BrokerEndpoint, topic: &str) -> Self {
        Self {
            connector,
            endpoint,
            topic: topic.to_string(),
            channel: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Fan-out topic of this link.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Mark the link active and connect. On failure the link stays active and the sender
    /// connects on its next attempt.
    pub async fn open(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        let mut channel = self.channel.lock().await;
        if channel.is_none() {
            *channel = Some(self.connect().await?);
            info!(broker = %self.endpoint, topic = %self.topic, "replication channel opened");
        }
        Ok(())
    }

    /// Mark the link inactive and close the channel.
    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "error closing replication channel");
            }
            info!(broker = %self.endpoint, topic = %self.topic, "replication channel closed");
        }
    }

    /// Returns true while at least one replica is registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns true if a channel is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Publish a block. Returns `Ok(false)` if the link is inactive and the block was not sent.
    /// On error the channel is dropped so the next attempt reconnects.
    pub async fn publish(&self, payload: Bytes) -> Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let mut slot = self.channel.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(channel) = slot.as_ref() else {
            return Err(ReplError::broker("replication channel unavailable"));
        };
        match channel.publish(&self.topic, payload).await {
            Ok(()) => Ok(true),
            Err(e) => {
                if let Some(broken) = slot.take() {
                    let _ = broken.close().await;
                }
                Err(e)
            }
        }
    }

    /// Replace the channel with a fresh one.
    pub async fn reconnect(&self) -> Result<()> {
        let mut slot = self.channel.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        if self.is_active() {
            *slot = Some(self.connect().await?);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connector.connect(&self.endpoint).await?;
        channel.declare_fanout_topic(&self.topic).await?;
        Ok(channel)
    }
}

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
pub(crate) struct SenderStatsInner {
    published: AtomicU64,
    discarded: AtomicU64,
    publish_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Counters of the sender loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    /// Blocks published.
    pub published: u64,
    /// Blocks dropped because no replica was registered when their turn came.
    pub discarded: u64,
    /// Failed publish attempts.
    pub publish_errors: u64,
    /// Successful channel re-creations after a failure.
    pub reconnects: u64,
}

impl SenderStatsInner {
    pub(crate) fn snapshot(&self) -> SenderStats {
        SenderStats {
            published: self.published.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Everything the sender loop works with.
pub(crate) struct SenderLoop {
    pub(crate) queue: Arc<SendQueue>,
    pub(crate) link: Arc<MasterLink>,
    pub(crate) replicas: Arc<Mutex<ReplicaRegistry>>,
    pub(crate) stats: Arc<SenderStatsInner>,
    pub(crate) retry_interval: Duration,
}

impl SenderLoop {
    /// Run until `shutdown` flips or its sender is dropped.
    pub(crate) fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    job = self.queue.take() => job,
                    _ = shutdown.changed() => break,
                };
                loop {
                    match self.link.publish(job.payload.clone()).await {
                        Ok(true) => {
                            self.queue.complete(&job);
                            self.replicas.lock().log(&job);
                            self.stats.published.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Ok(false) => {
                            self.queue.complete(&job);
                            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                            debug!(replicable = %job.replicable_id, "no replica registered, block discarded");
                            break;
                        }
                        Err(e) => {
                            self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                replicable = %job.replicable_id,
                                error = %e,
                                retry_in_ms = self.retry_interval.as_millis() as u64,
                                "publish failed, retrying the same block"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(self.retry_interval) => {}
                                _ = shutdown.changed() => {
                                    self.queue.complete(&job);
                                    return;
                                }
                            }
                            match self.link.reconnect().await {
                                Ok(()) => {
                                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    warn!(error = %e, "reconnecting to broker failed");
                                }
                            }
                        }
                    }
                }
            }
            debug!("sender loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Subscription;
    use crate::memory_broker::MemoryBroker;
    use crate::send_queue::SendJob;

    fn link(broker: &MemoryBroker) -> Arc<MasterLink> {
        Arc::new(MasterLink::new(
            Arc::new(broker.clone()),
            BrokerEndpoint::new("memory", 0),
            "ops",
        ))
    }

    fn job(tag: u8) -> SendJob {
        SendJob {
            replicable_id: "r".into(),
            payload: Bytes::from(vec![tag]),
            type_tags: vec!["Put"],
            uncompressed_bytes: 1,
        }
    }

    async fn live_subscription(broker: &MemoryBroker) -> Box<dyn Subscription> {
        let channel = broker
            .connect(&BrokerEndpoint::new("memory", 0))
            .await
            .unwrap();
        channel.declare_queue("replica", Some("ops")).await.unwrap();
        channel.subscribe("replica").await.unwrap()
    }

    #[tokio::test]
    async fn test_inactive_link_discards() {
        let broker = MemoryBroker::new();
        let link = link(&broker);
        assert!(!link.publish(Bytes::from_static(b"x")).await.unwrap());
        assert_eq!(broker.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_open_close() {
        let broker = MemoryBroker::new();
        let link = link(&broker);
        link.open().await.unwrap();
        assert!(link.is_connected().await);
        assert!(link.publish(Bytes::from_static(b"x")).await.unwrap());
        link.close().await;
        assert!(!link.is_active());
        assert!(!link.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_retries_same_job_after_outage() {
        let broker = MemoryBroker::new();
        let link = link(&broker);
        link.open().await.unwrap();
        let mut sub = live_subscription(&broker).await;

        let queue = Arc::new(SendQueue::new(1024));
        let stats = Arc::new(SenderStatsInner::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        broker.set_available(false);
        queue.enqueue(job(1)).unwrap();
        queue.enqueue(job(2)).unwrap();

        let handle = SenderLoop {
            queue: Arc::clone(&queue),
            link: Arc::clone(&link),
            replicas: Arc::new(Mutex::new(ReplicaRegistry::new())),
            stats: Arc::clone(&stats),
            retry_interval: Duration::from_secs(5),
        }
        .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(stats.snapshot().publish_errors >= 2);
        assert_eq!(stats.snapshot().published, 0);

        broker.set_available(true);
        assert_eq!(sub.next_message().await.unwrap().unwrap(), &[1u8][..]);
        assert_eq!(sub.next_message().await.unwrap().unwrap(), &[2u8][..]);
        assert_eq!(queue.queued_bytes(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 2);
        assert!(snapshot.reconnects >= 1);
    }
}
