//! Registry of replicas subscribed to this master, with per-replica send statistics.

use crate::descriptor::ReplicaDescriptor;
use crate::error::{ReplError, Result};
use crate::operation::ReplicableId;
use crate::send_queue::SendJob;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Receives replica registrations so they can be recovered after a restart.
///
/// Implementations must not block; they are called with the registration lock held.
pub trait ReplicaStore: Send + Sync {
    /// A replica was registered (or re-registered).
    fn store(&self, descriptor: &ReplicaDescriptor);

    /// A replica was unregistered.
    fn remove(&self, replica_id: &Uuid);
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplicaStore;

impl ReplicaStore for NoopReplicaStore {
    fn store(&self, _descriptor: &ReplicaDescriptor) {}

    fn remove(&self, _replica_id: &Uuid) {}
}

/// What was sent to one replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplicaStatistics {
    /// Broker messages carrying operations the replica wants.
    pub messages_sent: u64,
    /// Compressed bytes of those messages.
    pub bytes_sent: u64,
    /// Operations in those messages.
    pub operations_sent: u64,
    /// Operation count per type tag.
    pub operations_by_type: BTreeMap<String, u64>,
}

impl ReplicaStatistics {
    /// Average operations per message.
    pub fn average_operations_per_message(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.operations_sent as f64 / self.messages_sent as f64
        }
    }

    /// Average compressed bytes per message.
    pub fn average_message_bytes(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.bytes_sent as f64 / self.messages_sent as f64
        }
    }

    fn record(&mut self, job: &SendJob) {
        self.messages_sent += 1;
        self.bytes_sent += job.size();
        self.operations_sent += job.operation_count() as u64;
        for tag in &job.type_tags {
            *self.operations_by_type.entry((*tag).to_string()).or_insert(0) += 1;
        }
    }
}

struct RegisteredReplica {
    descriptor: ReplicaDescriptor,
    statistics: ReplicaStatistics,
}

/// Replicas currently registered with this master.
#[derive(Default)]
pub struct ReplicaRegistry {
    replicas: HashMap<Uuid, RegisteredReplica>,
}

impl ReplicaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a replica. A registration with an existing ID replaces it and resets its
    /// statistics. Returns the replaced descriptor.
    pub fn register(&mut self, descriptor: ReplicaDescriptor) -> Option<ReplicaDescriptor> {
        self.replicas
            .insert(
                descriptor.replica_id,
                RegisteredReplica {
                    descriptor,
                    statistics: ReplicaStatistics::default(),
                },
            )
            .map(|previous| previous.descriptor)
    }

    /// Remove a replica.
    pub fn unregister(&mut self, replica_id: &Uuid) -> Result<ReplicaDescriptor> {
        self.replicas
            .remove(replica_id)
            .map(|entry| entry.descriptor)
            .ok_or(ReplError::UnknownReplica {
                replica_id: *replica_id,
            })
    }

    /// Remove every replica and return their descriptors.
    pub fn remove_all(&mut self) -> Vec<ReplicaDescriptor> {
        self.replicas
            .drain()
            .map(|(_, entry)| entry.descriptor)
            .collect()
    }

    /// Look up a replica.
    pub fn get(&self, replica_id: &Uuid) -> Option<&ReplicaDescriptor> {
        self.replicas.get(replica_id).map(|entry| &entry.descriptor)
    }

    /// Find the replica registered by `server_id`, if any.
    pub fn find_by_server(&self, server_id: &Uuid) -> Option<&ReplicaDescriptor> {
        self.replicas
            .values()
            .map(|entry| &entry.descriptor)
            .find(|descriptor| &descriptor.server_id == server_id)
    }

    /// All registered descriptors, oldest registration first.
    pub fn descriptors(&self) -> Vec<ReplicaDescriptor> {
        let mut all: Vec<_> = self
            .replicas
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        all.sort_by_key(|d| (d.registered_at_ms, d.replica_id));
        all
    }

    /// Number of registered replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Returns true if no replica is registered.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Replicables at least one registered replica wants.
    pub fn wanted_replicable_ids(&self) -> BTreeSet<ReplicableId> {
        self.replicas
            .values()
            .flat_map(|entry| entry.descriptor.replicable_ids.iter().cloned())
            .collect()
    }

    /// Returns true if any registered replica wants `replicable_id`.
    pub fn is_wanted(&self, replicable_id: &ReplicableId) -> bool {
        self.replicas
            .values()
            .any(|entry| entry.descriptor.wants(replicable_id))
    }

    /// Account a published job to every replica that wants its replicable.
    pub fn log(&mut self, job: &SendJob) {
        for entry in self.replicas.values_mut() {
            if entry.descriptor.wants(&job.replicable_id) {
                entry.statistics.record(job);
            }
        }
    }

    /// Statistics of one replica.
    pub fn statistics(&self, replica_id: &Uuid) -> Option<ReplicaStatistics> {
        self.replicas
            .get(replica_id)
            .map(|entry| entry.statistics.clone())
    }
}
