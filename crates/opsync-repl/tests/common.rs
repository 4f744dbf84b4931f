//! Common fixtures for the replication integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use opsync_repl::compression::decompress;
use opsync_repl::registry::NoopReplicaStore;
use opsync_repl::store::{KeyValueStore, StoreOp};
use opsync_repl::wire::{decode_message, InboundMessage};
use opsync_repl::{
    BrokerConnector, BrokerEndpoint, LocalMasterEndpoint, MasterEndpoint, MemoryBroker,
    ReplConfig, Replicable, ReplicaClient, ReplicaDescriptor, ReplicableId, ReplicableRegistry,
    ReplicationMaster, Result, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Configuration with small, deterministic limits for fast tests.
pub fn test_config() -> ReplConfig {
    let mut config = ReplConfig::default();
    config.send_queue.max_queued_bytes = Some(1 << 20);
    config.send_queue.retry_interval_ms = 20;
    config.receiver.connection_watchdog_ms = 50;
    config
}

/// One side of a replication pair: its replicables and their stores.
pub struct Side {
    pub replicables: Arc<ReplicableRegistry>,
    pub stores: Vec<Arc<KeyValueStore>>,
}

impl Side {
    pub fn new(ids: &[&str]) -> Self {
        let replicables = Arc::new(ReplicableRegistry::new());
        let stores: Vec<_> = ids
            .iter()
            .map(|id| Arc::new(KeyValueStore::new(*id)))
            .collect();
        for store in &stores {
            replicables.add(store.clone());
        }
        Self {
            replicables,
            stores,
        }
    }

    pub fn store(&self, id: &str) -> &Arc<KeyValueStore> {
        self.stores
            .iter()
            .find(|store| store.id().as_str() == id)
            .expect("store hosted on this side")
    }
}

pub async fn start_master(broker: &MemoryBroker, config: ReplConfig, ids: &[&str]) -> (ReplicationMaster, Side) {
    let side = Side::new(ids);
    let master = ReplicationMaster::start(
        config,
        Arc::new(broker.clone()),
        Arc::clone(&side.replicables),
        Arc::new(NoopReplicaStore),
        vec![],
    )
    .await
    .expect("master starts");
    (master, side)
}

pub fn start_client(broker: &MemoryBroker, config: ReplConfig, ids: &[&str]) -> (ReplicaClient, Side) {
    let side = Side::new(ids);
    let client = ReplicaClient::new(config, Arc::new(broker.clone()), Arc::clone(&side.replicables));
    (client, side)
}

pub fn replica(ids: &[&str]) -> ReplicaDescriptor {
    ReplicaDescriptor::new(
        Uuid::new_v4(),
        "10.0.0.9",
        "1.0",
        ids.iter().map(|id| ReplicableId::from(*id)).collect(),
    )
}

pub fn local_endpoint(master: &ReplicationMaster) -> Arc<dyn MasterEndpoint> {
    Arc::new(LocalMasterEndpoint::new(master.clone(), "in-process"))
}

/// A raw queue bound to the master's topic, to observe exactly what is published.
pub async fn tap(broker: &MemoryBroker, topic: &str, queue: &str) -> Box<dyn Subscription> {
    let channel = broker
        .connect(&BrokerEndpoint::new("memory", 0))
        .await
        .expect("connect");
    channel.declare_queue(queue, Some(topic)).await.expect("declare");
    channel.subscribe(queue).await.expect("subscribe")
}

pub fn decode(raw: &Bytes) -> InboundMessage {
    let plain = decompress(raw).expect("decompress");
    decode_message(Bytes::from(plain)).expect("decode")
}

pub fn decode_op(payload: &Bytes) -> StoreOp {
    bincode::deserialize(payload).expect("store op")
}

/// Next published message, or `None` if nothing arrives within `wait`.
pub async fn next_within(sub: &mut Box<dyn Subscription>, wait: Duration) -> Option<InboundMessage> {
    match tokio::time::timeout(wait, sub.next_message()).await {
        Ok(Ok(Some(raw))) => Some(decode(&raw)),
        _ => None,
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Endpoint that holds the answer to the initial-load request until released. The master has
/// already written the snapshot when `entered` fires.
pub struct GatedEndpoint {
    pub inner: Arc<dyn MasterEndpoint>,
    pub entered: Arc<Notify>,
    pub gate: Arc<Notify>,
}

impl GatedEndpoint {
    pub fn new(inner: Arc<dyn MasterEndpoint>) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl MasterEndpoint for GatedEndpoint {
    async fn register(&self, server_id: Uuid, version: &str, ids: &[ReplicableId]) -> Result<Uuid> {
        self.inner.register(server_id, version, ids).await
    }

    async fn deregister(&self, server_id: Uuid) -> Result<()> {
        self.inner.deregister(server_id).await
    }

    async fn request_initial_load(&self, ids: &[ReplicableId]) -> Result<String> {
        let queue = self.inner.request_initial_load(ids).await?;
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(queue)
    }
}
