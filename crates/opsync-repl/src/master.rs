//! Master role: streams operations of the hosted replicables to registered replicas.
//!
//! Listeners sit on exactly the replicables at least one registered replica wants. The broker
//! link opens with the first registration and closes with the last deregistration. Initial
//! loads are served over one-off queues.

use crate::batcher::OutboundBatcher;
use crate::broker::{BrokerChannel, BrokerConnector};
use crate::compression::CompressingSink;
use crate::config::ReplConfig;
use crate::descriptor::{MasterDescriptor, ReplicaDescriptor};
use crate::error::{ReplError, Result};
use crate::operation::{ExecutedOperation, ListenerId, OperationListener, Replicable, ReplicableId};
use crate::registry::{ReplicaRegistry, ReplicaStatistics, ReplicaStore};
use crate::replicables::{ReplicableLifecycleListener, ReplicableRegistry};
use crate::send_queue::SendQueue;
use crate::sender::{MasterLink, SenderLoop, SenderStatsInner};
use crate::status::{MasterStatus, ReplicaSummary};
use crate::wire;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Feeds locally executed operations into the batcher.
struct ReplicationListener {
    batcher: OutboundBatcher,
}

impl OperationListener for ReplicationListener {
    fn operation_executed(&self, replicable_id: &ReplicableId, operation: &ExecutedOperation) {
        if let Err(e) = self.batcher.submit(replicable_id, operation) {
            error!(replicable = %replicable_id, error = %e, "operation could not be queued for replication");
        }
    }
}

struct AttachedListener {
    replicable: Arc<dyn Replicable>,
    listener: ListenerId,
}

struct MasterInner {
    server_id: Uuid,
    config: ReplConfig,
    connector: Arc<dyn BrokerConnector>,
    replicables: Arc<ReplicableRegistry>,
    replicas: Arc<Mutex<ReplicaRegistry>>,
    attached: DashMap<ReplicableId, AttachedListener>,
    listener: Arc<ReplicationListener>,
    batcher: OutboundBatcher,
    queue: Arc<SendQueue>,
    link: Arc<MasterLink>,
    membership: tokio::sync::Mutex<()>,
    /// Serializes listener attachment between registrations and replicable lifecycle hooks.
    listening: Mutex<()>,
    store: Arc<dyn ReplicaStore>,
    sender_stats: Arc<SenderStatsInner>,
    shutdown: watch::Sender<bool>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    initial_loads_served: AtomicU64,
}

/// Master side of operation replication.
#[derive(Clone)]
pub struct ReplicationMaster {
    inner: Arc<MasterInner>,
}

impl ReplicationMaster {
    /// Start the master role on the current tokio runtime.
    ///
    /// `recovered` are replica registrations persisted before a restart; each is registered
    /// again as if the replica had just subscribed.
    pub async fn start(
        config: ReplConfig,
        connector: Arc<dyn BrokerConnector>,
        replicables: Arc<ReplicableRegistry>,
        store: Arc<dyn ReplicaStore>,
        recovered: Vec<ReplicaDescriptor>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(SendQueue::new(config.send_queue.resolved_limit_bytes()));
        let batcher = OutboundBatcher::new(
            config.batching.clone(),
            config.compression.clone(),
            Arc::clone(&queue),
            Handle::current(),
        );
        let link = Arc::new(MasterLink::new(
            Arc::clone(&connector),
            config.broker.endpoint.clone(),
            &config.broker.topic,
        ));
        let replicas = Arc::new(Mutex::new(ReplicaRegistry::new()));
        let sender_stats = Arc::new(SenderStatsInner::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sender_task = SenderLoop {
            queue: Arc::clone(&queue),
            link: Arc::clone(&link),
            replicas: Arc::clone(&replicas),
            stats: Arc::clone(&sender_stats),
            retry_interval: config.send_queue.retry_interval(),
        }
        .spawn(shutdown_rx);

        let server_id = Uuid::new_v4();
        info!(
            %server_id,
            topic = %config.broker.topic,
            queue_limit_bytes = queue.stats().limit_bytes,
            "replication master started"
        );

        let master = Self {
            inner: Arc::new(MasterInner {
                server_id,
                listener: Arc::new(ReplicationListener {
                    batcher: batcher.clone(),
                }),
                config,
                connector,
                replicables: Arc::clone(&replicables),
                replicas,
                attached: DashMap::new(),
                batcher,
                queue,
                link,
                membership: tokio::sync::Mutex::new(()),
                listening: Mutex::new(()),
                store,
                sender_stats,
                shutdown,
                sender_task: Mutex::new(Some(sender_task)),
                initial_loads_served: AtomicU64::new(0),
            }),
        };

        replicables.add_lifecycle_listener(Arc::new(MasterLifecycle {
            inner: Arc::downgrade(&master.inner),
        }));

        for descriptor in recovered {
            let replica_id = descriptor.replica_id;
            if let Err(e) = master.register_replica(descriptor).await {
                warn!(%replica_id, error = %e, "failed to restore replica registration");
            }
        }
        Ok(master)
    }

    /// Server ID of this instance.
    pub fn server_id(&self) -> Uuid {
        self.inner.server_id
    }

    /// Configuration the master runs with.
    pub fn config(&self) -> &ReplConfig {
        &self.inner.config
    }

    /// Register a replica. The broker link opens with the first replica; a registration with
    /// a known replica ID replaces the previous one. Returns the replica ID.
    pub async fn register_replica(&self, descriptor: ReplicaDescriptor) -> Result<Uuid> {
        let inner = &self.inner;
        let _membership = inner.membership.lock().await;

        if !inner.link.is_active() {
            if let Err(e) = inner.link.open().await {
                warn!(error = %e, "broker not reachable yet, sender will keep retrying");
            }
        }

        let replica_id = descriptor.replica_id;
        if let Some(previous) = inner.replicas.lock().register(descriptor.clone()) {
            info!(%replica_id, previous = %previous, "replica re-registered, previous registration replaced");
        }
        inner.reconcile_listeners();
        inner.store.store(&descriptor);
        info!(
            %replica_id,
            address = %descriptor.address,
            version = %descriptor.version,
            replicables = ?descriptor.replicable_ids,
            "replica registered"
        );
        Ok(replica_id)
    }

    /// Unregister a replica. Listeners no replica wants any more are detached; the broker link
    /// closes when the last replica leaves.
    pub async fn unregister_replica(&self, replica_id: &Uuid) -> Result<ReplicaDescriptor> {
        let inner = &self.inner;
        let _membership = inner.membership.lock().await;

        let removed = inner.replicas.lock().unregister(replica_id)?;
        inner.store.remove(replica_id);
        inner.reconcile_listeners();
        info!(%replica_id, address = %removed.address, "replica unregistered");

        if inner.replicas.lock().is_empty() {
            inner.batcher.flush();
            inner.link.close().await;
        }
        Ok(removed)
    }

    /// Unregister every replica, detach all listeners and close the broker link.
    pub async fn stop_all_replicas(&self) -> Vec<ReplicaDescriptor> {
        let inner = &self.inner;
        let _membership = inner.membership.lock().await;

        let removed = inner.replicas.lock().remove_all();
        for descriptor in &removed {
            inner.store.remove(&descriptor.replica_id);
        }
        inner.reconcile_listeners();
        inner.batcher.flush();
        inner.link.close().await;
        info!(replicas = removed.len(), "all replicas stopped");
        removed
    }

    /// Look up the replica a server registered.
    pub fn replica_for_server(&self, server_id: &Uuid) -> Option<ReplicaDescriptor> {
        self.inner.replicas.lock().find_by_server(server_id).cloned()
    }

    /// Registered replicas.
    pub fn replicas(&self) -> Vec<ReplicaDescriptor> {
        self.inner.replicas.lock().descriptors()
    }

    /// Returns true if at least one replica is registered.
    pub fn has_replicas(&self) -> bool {
        !self.inner.replicas.lock().is_empty()
    }

    /// Send statistics of one replica.
    pub fn replica_statistics(&self, replica_id: &Uuid) -> Option<ReplicaStatistics> {
        self.inner.replicas.lock().statistics(replica_id)
    }

    /// Replicables currently carrying the replication listener, ordered.
    pub fn listened_replicables(&self) -> Vec<ReplicableId> {
        let mut ids: Vec<_> = self
            .inner
            .attached
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stream snapshots of `replicable_ids`, in that order, over a fresh queue. Returns the
    /// queue name; the stream ends with an empty message.
    pub async fn serve_initial_load(&self, replicable_ids: &[ReplicableId]) -> Result<String> {
        let inner = &self.inner;
        let mut replicables = Vec::with_capacity(replicable_ids.len());
        for id in replicable_ids {
            let replicable = inner
                .replicables
                .get(id)
                .ok_or_else(|| ReplError::UnknownReplicable {
                    replicable_id: id.to_string(),
                })?;
            replicables.push(replicable);
        }

        let mut sink = CompressingSink::new(&inner.config.compression)?;
        let mut snapshot = Vec::new();
        for replicable in &replicables {
            snapshot.clear();
            replicable.write_snapshot(&mut snapshot)?;
            wire::write_snapshot_section(&mut sink, replicable.id(), &snapshot)?;
        }
        let frame = Bytes::from(sink.finish()?);

        let queue = format!("{}.initial-load.{}", inner.config.broker.topic, Uuid::new_v4());
        let channel = inner.connector.connect(&inner.config.broker.endpoint).await?;
        channel.declare_queue(&queue, None).await?;
        inner.initial_loads_served.fetch_add(1, Ordering::Relaxed);
        info!(
            queue = %queue,
            replicables = ?replicable_ids,
            bytes = frame.len(),
            "serving initial load"
        );

        let chunk_bytes = inner.config.broker.initial_load_chunk_bytes;
        let queue_name = queue.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_initial_load(channel.as_ref(), &queue_name, frame, chunk_bytes).await {
                warn!(queue = %queue_name, error = %e, "initial load transfer aborted");
            }
            let _ = channel.close().await;
        });
        Ok(queue)
    }

    /// Master descriptor a replica uses to reach this master.
    pub fn master_descriptor(
        &self,
        live_queue: &str,
        endpoint_url: &str,
        replicable_ids: Vec<ReplicableId>,
    ) -> MasterDescriptor {
        MasterDescriptor {
            broker: self.inner.config.broker.endpoint.clone(),
            topic: self.inner.config.broker.topic.clone(),
            live_queue: live_queue.to_string(),
            endpoint_url: endpoint_url.to_string(),
            bearer_token: None,
            replicable_ids,
        }
    }

    /// Close the open batch so its operations are queued now.
    pub fn flush(&self) {
        self.inner.batcher.flush();
    }

    /// State of the master role.
    pub fn status(&self) -> MasterStatus {
        let inner = &self.inner;
        let replicas = {
            let registry = inner.replicas.lock();
            registry
                .descriptors()
                .into_iter()
                .map(|descriptor| {
                    let statistics = registry
                        .statistics(&descriptor.replica_id)
                        .unwrap_or_default();
                    ReplicaSummary::new(descriptor, statistics)
                })
                .collect()
        };
        let batcher = inner.batcher.stats();
        MasterStatus {
            server_id: inner.server_id,
            topic: inner.config.broker.topic.clone(),
            channel_active: inner.link.is_active(),
            replicas,
            listened_replicables: self.listened_replicables(),
            initial_loads_served: inner.initial_loads_served.load(Ordering::Relaxed),
            send_queue: inner.queue.stats(),
            replicas_stale: batcher.dropped_batches > 0,
            batcher,
            sender: inner.sender_stats.snapshot(),
        }
    }

    /// Flush pending operations, stop the sender and close the broker link. Blocks still queued
    /// are dropped.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.batcher.flush();
        let _ = inner.shutdown.send(true);
        let task = inner.sender_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "sender task ended abnormally");
            }
        }
        let dropped = inner.queue.clear();
        if dropped > 0 {
            warn!(dropped, "replication blocks dropped at shutdown");
        }
        {
            let _listening = inner.listening.lock();
            for id in self.listened_replicables() {
                inner.detach(&id);
            }
        }
        inner.link.close().await;
        info!(server_id = %inner.server_id, "replication master stopped");
    }
}

async fn stream_initial_load(
    channel: &dyn BrokerChannel,
    queue: &str,
    frame: Bytes,
    chunk_bytes: usize,
) -> Result<()> {
    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + chunk_bytes).min(frame.len());
        channel.send_to_queue(queue, frame.slice(offset..end)).await?;
        offset = end;
    }
    channel.send_to_queue(queue, Bytes::new()).await?;
    debug!(queue, bytes = frame.len(), "initial load sent");
    Ok(())
}

impl MasterInner {
    /// Make the attached listeners match the replicables wanted by registered replicas.
    fn reconcile_listeners(&self) {
        let _listening = self.listening.lock();
        let wanted = self.replicas.lock().wanted_replicable_ids();
        let stale: Vec<ReplicableId> = self
            .attached
            .iter()
            .filter(|entry| !wanted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            self.detach(&id);
        }
        for id in wanted {
            if !self.attached.contains_key(&id) {
                self.attach(&id);
            }
        }
    }

    fn attach(&self, replicable_id: &ReplicableId) {
        let Some(replicable) = self.replicables.get(replicable_id) else {
            warn!(replicable = %replicable_id, "replica wants a replicable not hosted here yet");
            return;
        };
        let listener = replicable.add_operation_listener(self.listener.clone());
        self.attached.insert(
            replicable_id.clone(),
            AttachedListener {
                replicable,
                listener,
            },
        );
        debug!(replicable = %replicable_id, "replication listener attached");
    }

    fn detach(&self, replicable_id: &ReplicableId) {
        if let Some((_, attached)) = self.attached.remove(replicable_id) {
            attached
                .replicable
                .remove_operation_listener(attached.listener);
            debug!(replicable = %replicable_id, "replication listener detached");
        }
    }
}

/// Keeps listeners in step with replicables appearing and disappearing.
struct MasterLifecycle {
    inner: Weak<MasterInner>,
}

impl ReplicableLifecycleListener for MasterLifecycle {
    fn replicable_added(&self, replicable: &Arc<dyn Replicable>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let id = replicable.id();
        let _listening = inner.listening.lock();
        inner.detach(id);
        if inner.replicas.lock().is_wanted(id) {
            inner.attach(id);
        }
    }

    fn replicable_removed(&self, replicable_id: &ReplicableId) {
        if let Some(inner) = self.inner.upgrade() {
            let _listening = inner.listening.lock();
            inner.detach(replicable_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerEndpoint, Subscription};
    use crate::compression::decompress;
    use crate::memory_broker::MemoryBroker;
    use crate::registry::NoopReplicaStore;
    use crate::store::KeyValueStore;
    use crate::wire::SnapshotSections;

    struct Setup {
        broker: MemoryBroker,
        stores: Vec<Arc<KeyValueStore>>,
        master: ReplicationMaster,
    }

    async fn setup(ids: &[&str]) -> Setup {
        let broker = MemoryBroker::new();
        let replicables = Arc::new(ReplicableRegistry::new());
        let stores: Vec<_> = ids
            .iter()
            .map(|id| Arc::new(KeyValueStore::new(*id)))
            .collect();
        for store in &stores {
            replicables.add(store.clone());
        }
        let mut config = ReplConfig::default();
        config.send_queue.max_queued_bytes = Some(1 << 20);
        let master = ReplicationMaster::start(
            config,
            Arc::new(broker.clone()),
            replicables,
            Arc::new(NoopReplicaStore),
            vec![],
        )
        .await
        .unwrap();
        Setup {
            broker,
            stores,
            master,
        }
    }

    fn replica(ids: &[&str]) -> ReplicaDescriptor {
        ReplicaDescriptor::new(
            Uuid::new_v4(),
            "10.0.0.5",
            "1.0",
            ids.iter().map(|id| ReplicableId::from(*id)).collect(),
        )
    }

    #[tokio::test]
    async fn test_listeners_follow_registrations() {
        let s = setup(&["a", "b", "c"]).await;
        assert!(s.master.listened_replicables().is_empty());

        let r1 = s.master.register_replica(replica(&["a", "b"])).await.unwrap();
        let r2 = s.master.register_replica(replica(&["b", "c"])).await.unwrap();
        assert_eq!(s.master.listened_replicables().len(), 3);
        assert!(s.stores.iter().all(|store| store.listener_count() == 1));

        s.master.unregister_replica(&r1).await.unwrap();
        assert_eq!(
            s.master.listened_replicables(),
            vec![ReplicableId::from("b"), ReplicableId::from("c")]
        );
        assert_eq!(s.stores[0].listener_count(), 0);

        s.master.unregister_replica(&r2).await.unwrap();
        assert!(s.master.listened_replicables().is_empty());
        assert!(!s.master.status().channel_active);
    }

    #[tokio::test]
    async fn test_unknown_replica_unregister_fails() {
        let s = setup(&["a"]).await;
        let err = s.master.unregister_replica(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ReplError::UnknownReplica { .. }));
    }

    #[tokio::test]
    async fn test_channel_opens_with_first_replica() {
        let s = setup(&["a"]).await;
        assert_eq!(s.broker.stats().connections, 0);
        s.master.register_replica(replica(&["a"])).await.unwrap();
        s.master.register_replica(replica(&["a"])).await.unwrap();
        assert_eq!(s.broker.stats().connections, 1);
        assert!(s.master.status().channel_active);
    }

    #[tokio::test]
    async fn test_replicable_added_later_gets_listener() {
        let broker = MemoryBroker::new();
        let replicables = Arc::new(ReplicableRegistry::new());
        let master = ReplicationMaster::start(
            ReplConfig::default(),
            Arc::new(broker),
            Arc::clone(&replicables),
            Arc::new(NoopReplicaStore),
            vec![],
        )
        .await
        .unwrap();
        master.register_replica(replica(&["late"])).await.unwrap();
        assert!(master.listened_replicables().is_empty());

        let store = Arc::new(KeyValueStore::new("late"));
        replicables.add(store.clone());
        assert_eq!(store.listener_count(), 1);

        replicables.remove(&"late".into());
        assert_eq!(store.listener_count(), 0);
        assert!(master.listened_replicables().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicable_churn_during_registrations_keeps_listeners_exact() {
        let broker = MemoryBroker::new();
        let replicables = Arc::new(ReplicableRegistry::new());
        let master = ReplicationMaster::start(
            ReplConfig::default(),
            Arc::new(broker),
            Arc::clone(&replicables),
            Arc::new(NoopReplicaStore),
            vec![],
        )
        .await
        .unwrap();

        let churn = {
            let replicables = Arc::clone(&replicables);
            std::thread::spawn(move || {
                let mut instances = Vec::new();
                for _ in 0..300 {
                    // Each add replaces the previous instance of "late".
                    let store = Arc::new(KeyValueStore::new("late"));
                    replicables.add(store.clone());
                    instances.push(store);
                }
                instances
            })
        };
        while !churn.is_finished() {
            let replica_id = master.register_replica(replica(&["late"])).await.unwrap();
            master.unregister_replica(&replica_id).await.unwrap();
        }
        let instances = churn.join().unwrap();

        assert!(instances.iter().all(|store| store.listener_count() == 0));
        assert!(master.listened_replicables().is_empty());

        master.register_replica(replica(&["late"])).await.unwrap();
        let (current, replaced) = instances.split_last().unwrap();
        assert_eq!(current.listener_count(), 1);
        assert!(replaced.iter().all(|store| store.listener_count() == 0));
    }

    #[tokio::test]
    async fn test_stop_all_replicas() {
        let s = setup(&["a", "b"]).await;
        s.master.register_replica(replica(&["a"])).await.unwrap();
        s.master.register_replica(replica(&["b"])).await.unwrap();
        assert_eq!(s.master.stop_all_replicas().await.len(), 2);
        assert!(!s.master.has_replicas());
        assert!(s.stores.iter().all(|store| store.listener_count() == 0));
        assert!(!s.master.status().channel_active);
    }

    #[tokio::test]
    async fn test_initial_load_streams_requested_order() {
        let s = setup(&["a", "b"]).await;
        s.stores[0].put("x", 1).unwrap();
        s.stores[1].put("y", 2).unwrap();

        let order = vec![ReplicableId::from("b"), ReplicableId::from("a")];
        let queue = s.master.serve_initial_load(&order).await.unwrap();
        let channel = s
            .broker
            .connect(&BrokerEndpoint::new("memory", 0))
            .await
            .unwrap();
        let mut sub = channel.subscribe(&queue).await.unwrap();
        let mut frame = Vec::new();
        loop {
            let message = sub.next_message().await.unwrap().unwrap();
            if message.is_empty() {
                break;
            }
            frame.extend_from_slice(&message);
        }

        let mut sections = SnapshotSections::new(Bytes::from(decompress(&frame).unwrap()));
        let target_b = KeyValueStore::new("b");
        target_b
            .read_snapshot(&mut sections.next_section(&order[0]).unwrap().as_ref())
            .unwrap();
        let target_a = KeyValueStore::new("a");
        target_a
            .read_snapshot(&mut sections.next_section(&order[1]).unwrap().as_ref())
            .unwrap();
        assert!(sections.is_exhausted());
        assert_eq!(target_a.get("x"), Some(1));
        assert_eq!(target_b.get("y"), Some(2));
        assert_eq!(s.master.status().initial_loads_served, 1);
    }

    #[tokio::test]
    async fn test_initial_load_of_unknown_replicable_fails() {
        let s = setup(&["a"]).await;
        let err = s
            .master
            .serve_initial_load(&[ReplicableId::from("missing")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::UnknownReplicable { .. }));
    }

    #[tokio::test]
    async fn test_recovered_replicas_reregistered() {
        let broker = MemoryBroker::new();
        let replicables = Arc::new(ReplicableRegistry::new());
        let store = Arc::new(KeyValueStore::new("a"));
        replicables.add(store.clone());
        let recovered = replica(&["a"]);
        let master = ReplicationMaster::start(
            ReplConfig::default(),
            Arc::new(broker),
            replicables,
            Arc::new(NoopReplicaStore),
            vec![recovered.clone()],
        )
        .await
        .unwrap();
        assert_eq!(master.replicas(), vec![recovered]);
        assert_eq!(store.listener_count(), 1);
    }
}
