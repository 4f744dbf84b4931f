//! Descriptors identifying replicas (master side) and masters (replica side).

use crate::broker::BrokerEndpoint;
use crate::operation::ReplicableId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One replica registered with this master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// ID the master assigned to the replica at registration.
    pub replica_id: Uuid,
    /// Server identifier the replica presented.
    pub server_id: Uuid,
    /// Network address the replica registered from.
    pub address: String,
    /// Build version the replica reported.
    pub version: String,
    /// Replicables whose operations the replica wants.
    pub replicable_ids: Vec<ReplicableId>,
    /// Registration time (milliseconds since epoch).
    pub registered_at_ms: u64,
}

impl ReplicaDescriptor {
    /// Create a new descriptor with a fresh replica ID.
    pub fn new(
        server_id: Uuid,
        address: &str,
        version: &str,
        replicable_ids: Vec<ReplicableId>,
    ) -> Self {
        Self {
            replica_id: Uuid::new_v4(),
            server_id,
            address: address.to_string(),
            version: version.to_string(),
            replicable_ids,
            registered_at_ms: now_ms(),
        }
    }

    /// Returns true if the replica wants operations of `replicable_id`.
    pub fn wants(&self, replicable_id: &ReplicableId) -> bool {
        self.replicable_ids.iter().any(|id| id == replicable_id)
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica {} at {}", self.replica_id, self.address)
    }
}

/// The master a replica instance replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterDescriptor {
    /// Broker the master publishes to.
    pub broker: BrokerEndpoint,
    /// Fan-out topic the master publishes operations on.
    pub topic: String,
    /// Queue this replica binds to the topic for the live stream.
    pub live_queue: String,
    /// Base URL of the master's registration/initial-load endpoint.
    pub endpoint_url: String,
    /// Bearer token presented on handshake requests.
    pub bearer_token: Option<String>,
    /// Replicables to receive, in the order used for the initial load.
    pub replicable_ids: Vec<ReplicableId>,
}

impl MasterDescriptor {
    /// Key under which in-flight initial loads from this master are tracked.
    pub fn key(&self) -> String {
        format!("{}/{}", self.broker, self.topic)
    }
}

impl fmt::Display for MasterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "master {}/{} via {}", self.broker, self.topic, self.endpoint_url)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
