//! Management views of the master and replica roles.

use crate::batcher::BatcherStats;
use crate::bootstrap::BootstrapPhase;
use crate::descriptor::ReplicaDescriptor;
use crate::operation::ReplicableId;
use crate::registry::ReplicaStatistics;
use crate::send_queue::SendQueueStats;
use crate::sender::SenderStats;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One registered replica and what was sent to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaSummary {
    /// Registration record.
    pub descriptor: ReplicaDescriptor,
    /// Send statistics.
    pub statistics: ReplicaStatistics,
    /// Average operations per broker message.
    pub average_operations_per_message: f64,
    /// Average compressed bytes per broker message.
    pub average_message_bytes: f64,
}

impl ReplicaSummary {
    pub(crate) fn new(descriptor: ReplicaDescriptor, statistics: ReplicaStatistics) -> Self {
        Self {
            average_operations_per_message: statistics.average_operations_per_message(),
            average_message_bytes: statistics.average_message_bytes(),
            descriptor,
            statistics,
        }
    }
}

/// State of the master role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterStatus {
    /// Server ID of this instance.
    pub server_id: Uuid,
    /// Fan-out topic.
    pub topic: String,
    /// Whether the broker link is open (at least one replica registered).
    pub channel_active: bool,
    /// Registered replicas.
    pub replicas: Vec<ReplicaSummary>,
    /// Replicables that currently carry the replication listener.
    pub listened_replicables: Vec<ReplicableId>,
    /// Initial loads served since start.
    pub initial_loads_served: u64,
    /// Send queue counters.
    pub send_queue: SendQueueStats,
    /// Batching counters.
    pub batcher: BatcherStats,
    /// Sender loop counters.
    pub sender: SenderStats,
    /// Set once a block was dropped; replicas may have missed operations.
    pub replicas_stale: bool,
}

/// State of the replica role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStatus {
    /// Whether this instance replicates from a master.
    pub is_replica: bool,
    /// Master replicated from, if any.
    pub master: Option<String>,
    /// Replica ID the master assigned.
    pub replica_id: Option<String>,
    /// Bootstrap phase.
    pub phase: BootstrapPhase,
    /// Set while a bootstrap is in progress.
    pub replication_starting: bool,
    /// Receiver buffers without applying.
    pub suspended: bool,
    /// Receiver no longer consumes.
    pub stopped: bool,
    /// Receiver stopped after an apply failure.
    pub failed: bool,
    /// Buffered messages.
    pub message_queue_len: usize,
    /// Buffered operations per replicable.
    pub operation_queue_lens: BTreeMap<String, usize>,
    /// Replicables whose initial load is still pending.
    pub initial_load_pending: BTreeMap<String, bool>,
    /// Messages received on the live queue.
    pub messages_received: u64,
    /// Operations applied.
    pub operations_applied: u64,
    /// Last error, if any.
    pub last_error: Option<String>,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            is_replica: false,
            master: None,
            replica_id: None,
            phase: BootstrapPhase::NotReplicating,
            replication_starting: false,
            suspended: false,
            stopped: false,
            failed: false,
            message_queue_len: 0,
            operation_queue_lens: BTreeMap::new(),
            initial_load_pending: BTreeMap::new(),
            messages_received: 0,
            operations_applied: 0,
            last_error: None,
        }
    }
}
