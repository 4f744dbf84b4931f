//! Publish/subscribe broker contract.
//!
//! The master publishes replication blocks to a fan-out topic; every replica binds its own live
//! queue to that topic. Initial loads travel over one-off queues addressed directly. Concrete
//! brokers implement [`BrokerConnector`]; the in-process [`crate::memory_broker::MemoryBroker`]
//! is the implementation used by tests and the demo.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a message broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
}

impl BrokerEndpoint {
    /// Create an endpoint.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::new("localhost", 5672)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens channels to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Connect to the broker at `endpoint`.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn BrokerChannel>>;
}

/// An open channel to the broker. Channels are single-owner.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a fan-out topic. Idempotent.
    async fn declare_fanout_topic(&self, topic: &str) -> Result<()>;

    /// Declare a queue, optionally binding it to a fan-out topic. Idempotent.
    async fn declare_queue(&self, queue: &str, bind_to: Option<&str>) -> Result<()>;

    /// Publish one message to every queue bound to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Send one message directly to `queue`.
    async fn send_to_queue(&self, queue: &str, payload: Bytes) -> Result<()>;

    /// Start consuming `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>>;

    /// Delete `queue`; its consumer observes the end of the stream.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Close the channel. Further calls fail.
    async fn close(&self) -> Result<()>;
}

/// Message stream of one consumed queue.
#[async_trait]
pub trait Subscription: Send {
    /// Next message in arrival order, or `None` once the queue was deleted.
    async fn next_message(&mut self) -> Result<Option<Bytes>>;
}
