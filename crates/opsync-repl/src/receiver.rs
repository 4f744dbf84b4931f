//! Replica side of the live stream.
//!
//! A single task consumes the live queue, decompresses each message and applies its operation
//! records to the addressed replicable in arrival order. While suspended, decoded messages are
//! buffered; resuming drains the buffer in order before any newer message is applied. Applying
//! happens under the gate lock so draining and live application never interleave.
//!
//! The topic is shared by every replica of a master, so messages for replicables this replica
//! did not request are skipped even when a replicable of that id is hosted locally.

use crate::broker::Subscription;
use crate::compression::decompress;
use crate::error::{ReplError, Result};
use crate::operation::ReplicableId;
use crate::replicables::ReplicableRegistry;
use crate::wire::{decode_message, InboundMessage};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Default)]
struct Gate {
    suspended: bool,
    stopped: bool,
    failed: bool,
    backlog: VecDeque<InboundMessage>,
    last_error: Option<String>,
    failed_replicable: Option<String>,
}

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
struct ReceiverStatsInner {
    messages_received: AtomicU64,
    operations_applied: AtomicU64,
    messages_skipped: AtomicU64,
}

/// Counters of the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Messages taken from the live queue.
    pub messages_received: u64,
    /// Operations applied to local replicables.
    pub operations_applied: u64,
    /// Messages for replicables not requested from the master or not hosted here.
    pub messages_skipped: u64,
}

struct ReceiverInner {
    replicables: Arc<ReplicableRegistry>,
    requested: HashSet<ReplicableId>,
    gate: Mutex<Gate>,
    stats: ReceiverStatsInner,
}

impl ReceiverInner {
    fn apply(&self, message: &InboundMessage) -> Result<()> {
        if !self.requested.contains(&message.replicable_id) {
            self.stats.messages_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(replicable = %message.replicable_id, "message for replicable not requested, skipped");
            return Ok(());
        }
        let Some(replicable) = self.replicables.get(&message.replicable_id) else {
            self.stats.messages_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(replicable = %message.replicable_id, "message for replicable not hosted here, skipped");
            return Ok(());
        };
        for op in &message.operations {
            replicable
                .apply_operation(op)
                .map_err(|e| match e {
                    apply @ ReplError::Apply { .. } => apply,
                    other => ReplError::Apply {
                        replicable_id: message.replicable_id.to_string(),
                        msg: other.to_string(),
                    },
                })?;
            self.stats.operations_applied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn drain(&self, gate: &mut Gate) {
        while let Some(message) = gate.backlog.pop_front() {
            if let Err(e) = self.apply(&message) {
                self.fail(gate, e);
                return;
            }
        }
    }

    fn fail(&self, gate: &mut Gate, e: ReplError) {
        error!(error = %e, "replica is no longer consistent with its master, receiver stopped");
        if let ReplError::Apply { replicable_id, .. } = &e {
            gate.failed_replicable = Some(replicable_id.clone());
        }
        gate.failed = true;
        gate.backlog.clear();
        gate.last_error = Some(e.to_string());
    }

    async fn run(self: Arc<Self>, mut subscription: Box<dyn Subscription>) {
        loop {
            let raw = match subscription.next_message().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    info!("live queue closed, receiver finished");
                    self.gate.lock().stopped = true;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "live queue failed, receiver finished");
                    let mut gate = self.gate.lock();
                    gate.stopped = true;
                    gate.last_error = Some(e.to_string());
                    break;
                }
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            let decoded =
                decompress(&raw).and_then(|plain| decode_message(Bytes::from(plain)));

            let mut gate = self.gate.lock();
            if gate.stopped || gate.failed {
                break;
            }
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    self.fail(&mut gate, e);
                    break;
                }
            };
            if gate.suspended {
                gate.backlog.push_back(message);
                continue;
            }
            if let Err(e) = self.apply(&message) {
                self.fail(&mut gate, e);
                break;
            }
        }
    }
}

/// Consumes the live queue of one master.
pub struct ReplicationReceiver {
    inner: Arc<ReceiverInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationReceiver {
    /// Start consuming `subscription`, applying only messages for the `requested` replicables.
    /// A receiver started suspended buffers until resumed.
    pub fn start(
        subscription: Box<dyn Subscription>,
        replicables: Arc<ReplicableRegistry>,
        requested: HashSet<ReplicableId>,
        suspended: bool,
    ) -> Self {
        let inner = Arc::new(ReceiverInner {
            replicables,
            requested,
            gate: Mutex::new(Gate {
                suspended,
                ..Default::default()
            }),
            stats: ReceiverStatsInner::default(),
        });
        let task = tokio::spawn(Arc::clone(&inner).run(subscription));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Suspend or resume application. Resuming applies the buffered messages in order first.
    pub fn set_suspended(&self, suspended: bool) -> Result<()> {
        let mut gate = self.inner.gate.lock();
        if !suspended {
            let buffered = gate.backlog.len();
            self.inner.drain(&mut gate);
            if buffered > 0 {
                debug!(buffered, "buffered messages applied on resume");
            }
        }
        gate.suspended = suspended;
        if gate.failed {
            return Err(ReplError::Apply {
                replicable_id: gate.failed_replicable.clone().unwrap_or_default(),
                msg: gate.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Stop consuming. With `apply_queued` the buffered messages are applied first, otherwise
    /// they are discarded.
    pub fn stop(&self, apply_queued: bool) {
        {
            let mut gate = self.inner.gate.lock();
            if apply_queued && !gate.failed {
                self.inner.drain(&mut gate);
            } else {
                let discarded = gate.backlog.len();
                gate.backlog.clear();
                if discarded > 0 {
                    info!(discarded, "buffered messages discarded on stop");
                }
            }
            gate.stopped = true;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Whether messages are buffered instead of applied.
    pub fn is_suspended(&self) -> bool {
        self.inner.gate.lock().suspended
    }

    /// Whether the receiver no longer consumes.
    pub fn is_stopped(&self) -> bool {
        let gate = self.inner.gate.lock();
        gate.stopped || gate.failed
    }

    /// Whether an apply failure stopped the receiver.
    pub fn has_failed(&self) -> bool {
        self.inner.gate.lock().failed
    }

    /// Last recorded error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.gate.lock().last_error.clone()
    }

    /// Buffered messages.
    pub fn message_queue_len(&self) -> usize {
        self.inner.gate.lock().backlog.len()
    }

    /// Buffered operations per replicable.
    pub fn operation_queue_lens(&self) -> BTreeMap<String, usize> {
        let gate = self.inner.gate.lock();
        let mut lens = BTreeMap::new();
        for message in &gate.backlog {
            *lens.entry(message.replicable_id.to_string()).or_insert(0) += message.operations.len();
        }
        lens
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            messages_received: self.inner.stats.messages_received.load(Ordering::Relaxed),
            operations_applied: self.inner.stats.operations_applied.load(Ordering::Relaxed),
            messages_skipped: self.inner.stats.messages_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ReplicationReceiver {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
