//! Replica role: registers with a master, loads its snapshots and follows the live stream.
//!
//! The live queue is bound and consumed (suspended) before the initial load is requested, so
//! every operation the snapshot misses is already buffered when the snapshot lands. Buffered
//! operations are applied only after every snapshot was read.

use crate::broker::{BrokerChannel, BrokerConnector, Subscription};
use crate::compression::decompress;
use crate::config::ReplConfig;
use crate::descriptor::MasterDescriptor;
use crate::endpoint::MasterEndpoint;
use crate::error::{ReplError, Result};
use crate::operation::Replicable;
use crate::receiver::ReplicationReceiver;
use crate::replicables::ReplicableRegistry;
use crate::status::ReplicationStatus;
use crate::wire::SnapshotSections;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the replica role stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// No master configured.
    NotReplicating,
    /// Handshake with the master in progress.
    Registering,
    /// Connecting to the broker and binding the live queue.
    AwaitingBrokerConnection,
    /// Reading the snapshot of one replicable.
    ReceivingSnapshot {
        /// Replicable being loaded.
        replicable_id: String,
    },
    /// Snapshots loaded, live operations applied as they arrive.
    Live,
    /// Replication was stopped explicitly.
    Stopped,
    /// The last bootstrap attempt failed.
    Failed {
        /// Error that ended the attempt.
        reason: String,
    },
}

/// Notified when a bootstrap starts or ends.
pub trait ReplicationStartingListener: Send + Sync {
    /// `starting` is true while a bootstrap is in progress.
    fn replication_starting_changed(&self, starting: bool);
}

/// Bootstrap attempt counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapStats {
    /// Bootstraps started.
    pub attempts: u64,
    /// Bootstraps that reached the live phase.
    pub successes: u64,
    /// Bootstraps that failed.
    pub failures: u64,
    /// Compressed initial-load bytes received.
    pub initial_load_bytes: u64,
}

#[derive(Debug, Default)]
struct BootstrapStatsInner {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    initial_load_bytes: AtomicU64,
}

struct Session {
    master: MasterDescriptor,
    replica_id: Uuid,
    endpoint: Arc<dyn MasterEndpoint>,
    channel: Box<dyn BrokerChannel>,
    receiver: ReplicationReceiver,
}

struct ClientInner {
    config: ReplConfig,
    server_id: Uuid,
    connector: Arc<dyn BrokerConnector>,
    replicables: Arc<ReplicableRegistry>,
    session: Mutex<Option<Session>>,
    initial_loads: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
    phase: Mutex<BootstrapPhase>,
    starting: AtomicBool,
    starting_listeners: Mutex<Vec<Arc<dyn ReplicationStartingListener>>>,
    initial_load_pending: Mutex<BTreeMap<String, bool>>,
    last_error: Mutex<Option<String>>,
    stats: BootstrapStatsInner,
}

/// Marks a bootstrap from one master as running. Stopping the replica signals the paired
/// receiver and waits for it to be dropped.
struct InitialLoadGuard<'a> {
    inner: &'a ClientInner,
    key: String,
}

impl<'a> InitialLoadGuard<'a> {
    fn acquire(inner: &'a ClientInner, key: String) -> Option<(Self, watch::Receiver<bool>)> {
        let mut running = inner.initial_loads.lock();
        if running.contains_key(&key) {
            return None;
        }
        let (stop, stopped) = watch::channel(false);
        running.insert(key.clone(), Arc::new(stop));
        Some((Self { inner, key }, stopped))
    }
}

impl Drop for InitialLoadGuard<'_> {
    fn drop(&mut self) {
        self.inner.initial_loads.lock().remove(&self.key);
    }
}

/// Replica side of operation replication.
#[derive(Clone)]
pub struct ReplicaClient {
    inner: Arc<ClientInner>,
}

impl ReplicaClient {
    /// Create the replica role for the replicables hosted in `replicables`.
    pub fn new(
        config: ReplConfig,
        connector: Arc<dyn BrokerConnector>,
        replicables: Arc<ReplicableRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                server_id: Uuid::new_v4(),
                connector,
                replicables,
                session: Mutex::new(None),
                initial_loads: Mutex::new(HashMap::new()),
                phase: Mutex::new(BootstrapPhase::NotReplicating),
                starting: AtomicBool::new(false),
                starting_listeners: Mutex::new(Vec::new()),
                initial_load_pending: Mutex::new(BTreeMap::new()),
                last_error: Mutex::new(None),
                stats: BootstrapStatsInner::default(),
            }),
        }
    }

    /// Server ID this instance registers with.
    pub fn server_id(&self) -> Uuid {
        self.inner.server_id
    }

    /// Current phase.
    pub fn phase(&self) -> BootstrapPhase {
        self.inner.phase.lock().clone()
    }

    /// Whether a bootstrap is in progress.
    pub fn is_replication_starting(&self) -> bool {
        self.inner.starting.load(Ordering::Acquire)
    }

    /// Register a listener for the replication-starting flag.
    pub fn add_replication_starting_listener(&self, listener: Arc<dyn ReplicationStartingListener>) {
        self.inner.starting_listeners.lock().push(listener);
    }

    /// Bootstrap counters.
    pub fn bootstrap_stats(&self) -> BootstrapStats {
        let stats = &self.inner.stats;
        BootstrapStats {
            attempts: stats.attempts.load(Ordering::Relaxed),
            successes: stats.successes.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            initial_load_bytes: stats.initial_load_bytes.load(Ordering::Relaxed),
        }
    }

    /// Register with `master`, load the snapshots of its replicables and follow its live stream.
    ///
    /// A bootstrap against a master whose bootstrap is already running, or that is already
    /// replicated from, returns immediately. Any failure after registration deregisters again
    /// and leaves nothing half-loaded reported as live. A stop while the bootstrap runs ends it
    /// with [`ReplError::BootstrapStopped`].
    pub async fn start_replicating_from(
        &self,
        master: MasterDescriptor,
        endpoint: Arc<dyn MasterEndpoint>,
    ) -> Result<()> {
        let inner = &self.inner;
        let key = master.key();
        if let Some(current) = self.current_master() {
            if current == key {
                warn!(master = %key, "already replicating from this master");
                return Ok(());
            }
            return Err(ReplError::AlreadyReplicating { master: current });
        }
        let Some((_guard, mut stopped)) = InitialLoadGuard::acquire(inner, key.clone()) else {
            warn!(master = %key, "initial load from this master already running, ignoring request");
            return Ok(());
        };

        inner.stats.attempts.fetch_add(1, Ordering::Relaxed);
        inner.set_starting(true);
        let previous = self.phase();
        inner.set_phase(BootstrapPhase::Registering);

        let registration = endpoint.register(
            inner.server_id,
            &inner.config.server_version,
            &master.replicable_ids,
        );
        let replica_id = match unless_stopped(&mut stopped, &master, registration).await {
            Ok(replica_id) => replica_id,
            Err(e @ ReplError::BootstrapStopped { .. }) => {
                // The registration may have reached the master already.
                inner.release(&master, endpoint.as_ref(), &e).await;
                return Err(e);
            }
            Err(e) => {
                warn!(master = %key, error = %e, "registration with master failed");
                inner.set_phase(previous);
                inner.stats.failures.fetch_add(1, Ordering::Relaxed);
                inner.set_starting(false);
                return Err(e);
            }
        };
        info!(master = %key, %replica_id, "registered with master");

        let (channel, receiver) = match inner.bootstrap(&master, endpoint.as_ref(), &mut stopped).await {
            Ok(live) => live,
            Err(e) => {
                inner.release(&master, endpoint.as_ref(), &e).await;
                return Err(e);
            }
        };
        let session = Session {
            master,
            replica_id,
            endpoint,
            channel,
            receiver,
        };
        let stop_requested_late = *stopped.borrow();
        if stop_requested_late {
            info!(master = %key, "stop requested as the bootstrap completed");
            inner.close_session(session, false).await;
            inner.set_phase(BootstrapPhase::Stopped);
            inner.set_starting(false);
            return Err(ReplError::BootstrapStopped { master: key });
        }
        let rejected = {
            let mut slot = inner.session.lock();
            if let Some(current) = slot.as_ref() {
                Some((current.master.key(), session))
            } else {
                *slot = Some(session);
                None
            }
        };
        if let Some((current, session)) = rejected {
            inner.close_session(session, false).await;
            inner.set_starting(false);
            return Err(ReplError::AlreadyReplicating { master: current });
        }
        *inner.last_error.lock() = None;
        inner.set_phase(BootstrapPhase::Live);
        inner.stats.successes.fetch_add(1, Ordering::Relaxed);
        inner.set_starting(false);
        Ok(())
    }

    /// Stop following the master. With `apply_queued` buffered operations are applied first,
    /// otherwise they are discarded.
    ///
    /// A bootstrap still running is interrupted: its queues are deleted and the replica is
    /// deregistered before this returns.
    pub async fn stop_replicating_from_master(&self, apply_queued: bool) -> Result<()> {
        let inner = &self.inner;
        let session = inner.session.lock().take();
        if let Some(session) = session {
            inner.close_session(session, apply_queued).await;
            inner.set_phase(BootstrapPhase::Stopped);
            return Ok(());
        }

        let running: Vec<(String, Arc<watch::Sender<bool>>)> = inner
            .initial_loads
            .lock()
            .iter()
            .map(|(key, stop)| (key.clone(), Arc::clone(stop)))
            .collect();
        if running.is_empty() {
            return Err(ReplError::NotReplicating);
        }
        for (key, stop) in running {
            info!(master = %key, "stopping bootstrap in progress");
            stop.send_replace(true);
            stop.closed().await;
        }
        // A bootstrap may have gone live just before it saw the stop.
        let session = inner.session.lock().take();
        if let Some(session) = session {
            inner.close_session(session, apply_queued).await;
        }
        inner.set_phase(BootstrapPhase::Stopped);
        Ok(())
    }

    /// Suspend or resume applying live operations.
    pub fn set_suspended(&self, suspended: bool) -> Result<()> {
        let session = self.inner.session.lock();
        let session = session.as_ref().ok_or(ReplError::NotReplicating)?;
        session.receiver.set_suspended(suspended)
    }

    /// Key of the master currently replicated from.
    pub fn current_master(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.master.key())
    }

    /// State of the replica role.
    pub fn status(&self) -> ReplicationStatus {
        let inner = &self.inner;
        let mut status = ReplicationStatus {
            phase: self.phase(),
            replication_starting: self.is_replication_starting(),
            initial_load_pending: inner.initial_load_pending.lock().clone(),
            last_error: inner.last_error.lock().clone(),
            ..Default::default()
        };
        let session = inner.session.lock();
        if let Some(session) = session.as_ref() {
            let receiver = &session.receiver;
            let stats = receiver.stats();
            status.is_replica = true;
            status.master = Some(session.master.key());
            status.replica_id = Some(session.replica_id.to_string());
            status.suspended = receiver.is_suspended();
            status.stopped = receiver.is_stopped();
            status.failed = receiver.has_failed();
            status.message_queue_len = receiver.message_queue_len();
            status.operation_queue_lens = receiver.operation_queue_lens();
            status.messages_received = stats.messages_received;
            status.operations_applied = stats.operations_applied;
            if let Some(e) = receiver.last_error() {
                if status.failed {
                    status.phase = BootstrapPhase::Failed { reason: e.clone() };
                }
                status.last_error = Some(e);
            }
        }
        status
    }
}

/// Resolves once a stop was requested for the running bootstrap.
async fn stop_requested(stopped: &mut watch::Receiver<bool>) {
    let requested = stopped.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Run `work` unless a stop is requested first.
async fn unless_stopped<T>(
    stopped: &mut watch::Receiver<bool>,
    master: &MasterDescriptor,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = work => result,
        () = stop_requested(stopped) => Err(ReplError::BootstrapStopped { master: master.key() }),
    }
}

impl ClientInner {
    fn set_phase(&self, phase: BootstrapPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            info!(from = ?*current, to = ?phase, "replica phase changed");
            *current = phase;
        }
    }

    fn set_starting(&self, starting: bool) {
        if self.starting.swap(starting, Ordering::AcqRel) == starting {
            return;
        }
        let listeners = self.starting_listeners.lock().clone();
        for listener in listeners {
            listener.replication_starting_changed(starting);
        }
    }

    /// Deregister after a bootstrap that ended without going live.
    async fn release(&self, master: &MasterDescriptor, endpoint: &dyn MasterEndpoint, e: &ReplError) {
        let key = master.key();
        if let Err(de) = endpoint.deregister(self.server_id).await {
            warn!(master = %key, error = %de, "deregistration after unfinished bootstrap failed");
        }
        self.initial_load_pending.lock().clear();
        if matches!(e, ReplError::BootstrapStopped { .. }) {
            info!(master = %key, "bootstrap stopped");
            self.set_phase(BootstrapPhase::Stopped);
        } else {
            error!(master = %key, error = %e, "bootstrap failed");
            *self.last_error.lock() = Some(e.to_string());
            self.set_phase(BootstrapPhase::Failed {
                reason: e.to_string(),
            });
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.set_starting(false);
    }

    /// Tear down a live session: stop the receiver, delete the live queue and deregister.
    async fn close_session(&self, session: Session, apply_queued: bool) {
        let key = session.master.key();
        session.receiver.stop(apply_queued);
        if let Err(e) = session.channel.delete_queue(&session.master.live_queue).await {
            warn!(queue = %session.master.live_queue, error = %e, "failed to delete live queue");
        }
        let _ = session.channel.close().await;
        if let Err(e) = session.endpoint.deregister(self.server_id).await {
            warn!(master = %key, error = %e, "deregistration failed");
        }
        for id in &session.master.replicable_ids {
            if let Some(replicable) = self.replicables.get(id) {
                replicable.stopped_replicating_from(&session.master);
            }
        }
        self.initial_load_pending.lock().clear();
        info!(master = %key, replica_id = %session.replica_id, apply_queued, "replication stopped");
    }

    /// Everything after registration. On success the live channel and the resumed receiver are
    /// returned; on failure both are already torn down.
    async fn bootstrap(
        &self,
        master: &MasterDescriptor,
        endpoint: &dyn MasterEndpoint,
        stopped: &mut watch::Receiver<bool>,
    ) -> Result<(Box<dyn BrokerChannel>, ReplicationReceiver)> {
        let mut replicables = Vec::with_capacity(master.replicable_ids.len());
        for id in &master.replicable_ids {
            let replicable = self
                .replicables
                .get(id)
                .ok_or_else(|| ReplError::UnknownReplicable {
                    replicable_id: id.to_string(),
                })?;
            replicables.push(replicable);
        }

        self.set_phase(BootstrapPhase::AwaitingBrokerConnection);
        let channel = self.connect_watched(master, stopped).await?;
        let subscription = match unless_stopped(stopped, master, bind_live_queue(channel.as_ref(), master)).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = channel.delete_queue(&master.live_queue).await;
                let _ = channel.close().await;
                return Err(e);
            }
        };
        let receiver = ReplicationReceiver::start(
            subscription,
            Arc::clone(&self.replicables),
            master.replicable_ids.iter().cloned().collect(),
            true,
        );
        debug!(queue = %master.live_queue, topic = %master.topic, "live queue bound, receiver suspended");

        {
            let mut pending = self.initial_load_pending.lock();
            for replicable in &replicables {
                pending.insert(replicable.id().to_string(), true);
            }
        }
        for replicable in &replicables {
            replicable.started_replicating_from(master);
        }

        let loaded = match self
            .load_snapshots(master, endpoint, &replicables, channel.as_ref(), stopped)
            .await
        {
            Ok(()) => receiver.set_suspended(false),
            Err(e) => Err(e),
        };
        if let Err(e) = loaded {
            receiver.stop(false);
            if let Err(de) = channel.delete_queue(&master.live_queue).await {
                debug!(queue = %master.live_queue, error = %de, "failed to delete live queue");
            }
            let _ = channel.close().await;
            for replicable in &replicables {
                replicable.stopped_replicating_from(master);
            }
            return Err(e);
        }
        Ok((channel, receiver))
    }

    /// Connect to the broker, warning periodically while the connection is not yet obtained.
    async fn connect_watched(
        &self,
        master: &MasterDescriptor,
        stopped: &mut watch::Receiver<bool>,
    ) -> Result<Box<dyn BrokerChannel>> {
        let interval = self
            .config
            .receiver
            .connection_watchdog()
            .max(Duration::from_millis(1));
        let started = Instant::now();
        let endpoint = master.broker.clone();
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            loop {
                ticker.tick().await;
                warn!(
                    broker = %endpoint,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still waiting for broker connection"
                );
            }
        });
        let result = unless_stopped(stopped, master, self.connector.connect(&master.broker)).await;
        watchdog.abort();
        result
    }

    /// Request the initial load and read it. The initial-load queue is deleted however this
    /// ends, through `live` when the dedicated channel could not be opened.
    async fn load_snapshots(
        &self,
        master: &MasterDescriptor,
        endpoint: &dyn MasterEndpoint,
        replicables: &[Arc<dyn Replicable>],
        live: &dyn BrokerChannel,
        stopped: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let ids: Vec<_> = replicables.iter().map(|r| r.id().clone()).collect();
        let queue = unless_stopped(stopped, master, endpoint.request_initial_load(&ids)).await?;
        info!(queue = %queue, replicables = ?ids, "receiving initial load");

        let channel = match unless_stopped(stopped, master, self.connector.connect(&master.broker)).await {
            Ok(channel) => channel,
            Err(e) => {
                delete_initial_load_queue(live, &queue).await;
                return Err(e);
            }
        };
        let received = self.receive_snapshots(channel.as_ref(), &queue, replicables);
        let result = unless_stopped(stopped, master, received).await;
        delete_initial_load_queue(channel.as_ref(), &queue).await;
        let _ = channel.close().await;
        result
    }

    async fn receive_snapshots(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        replicables: &[Arc<dyn Replicable>],
    ) -> Result<()> {
        let mut subscription = channel.subscribe(queue).await?;
        let mut frame = BytesMut::new();
        loop {
            match subscription.next_message().await? {
                Some(chunk) if chunk.is_empty() => break,
                Some(chunk) => frame.extend_from_slice(&chunk),
                None => {
                    return Err(ReplError::broker(format!(
                        "initial load queue {} closed before end of stream",
                        queue
                    )))
                }
            }
        }
        self.stats
            .initial_load_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let mut sections = SnapshotSections::new(Bytes::from(decompress(&frame)?));
        for replicable in replicables {
            let id = replicable.id();
            self.set_phase(BootstrapPhase::ReceivingSnapshot {
                replicable_id: id.to_string(),
            });
            let section = sections.next_section(id)?;
            replicable.clear_replica_state();
            replicable.read_snapshot(&mut section.as_ref())?;
            self.initial_load_pending.lock().insert(id.to_string(), false);
            info!(replicable = %id, bytes = section.len(), "initial load applied");
        }
        if !sections.is_exhausted() {
            return Err(ReplError::wire("trailing data after the last snapshot"));
        }
        Ok(())
    }
}

async fn delete_initial_load_queue(channel: &dyn BrokerChannel, queue: &str) {
    if let Err(e) = channel.delete_queue(queue).await {
        debug!(queue = %queue, error = %e, "failed to delete initial load queue");
    }
}

async fn bind_live_queue(
    channel: &dyn BrokerChannel,
    master: &MasterDescriptor,
) -> Result<Box<dyn Subscription>> {
    channel
        .declare_queue(&master.live_queue, Some(&master.topic))
        .await?;
    channel.subscribe(&master.live_queue).await
}
