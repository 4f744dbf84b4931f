//! Operation and replicable contract.
//!
//! A [`Replicable`] owns application state and executes [`Operation`]s against it. Whenever it
//! executes one locally it hands the serialized form to its registered [`OperationListener`]s;
//! the master side of replication is one such listener.

use crate::descriptor::MasterDescriptor;
use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable, globally unique identifier of a replicable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicableId(String);

impl ReplicableId {
    /// Create an identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The string form used on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicableId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicableId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An atomic, serializable state mutation.
///
/// Operations are not assumed to be idempotent; applying each exactly once and in order is the
/// job of the replication pipeline.
pub trait Operation: Send + Sync {
    /// The state the operation mutates.
    type State;
    /// What executing the operation returns to the caller.
    type Output;

    /// Execute the operation against `state`.
    fn execute_locally(&self, state: &mut Self::State) -> Self::Output;

    /// Short name of the operation type, used for statistics only.
    fn type_tag(&self) -> &'static str;

    /// Append the serialized operation to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<()>;
}

/// An operation that was executed locally, in serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedOperation {
    /// Operation type name for statistics.
    pub type_tag: &'static str,
    /// Serialized operation as produced by [`Operation::encode`].
    pub payload: Bytes,
}

impl ExecutedOperation {
    /// Create a new executed operation record.
    pub fn new(type_tag: &'static str, payload: impl Into<Bytes>) -> Self {
        Self {
            type_tag,
            payload: payload.into(),
        }
    }

    /// Serialize `operation` into a record.
    pub fn encode<O: Operation>(operation: &O) -> Result<Self> {
        let mut buf = Vec::new();
        operation.encode(&mut buf)?;
        Ok(Self::new(operation.type_tag(), buf))
    }
}

/// Receives notifications about operations executed by a replicable.
pub trait OperationListener: Send + Sync {
    /// Called after `operation` was executed by the replicable `replicable_id`.
    fn operation_executed(&self, replicable_id: &ReplicableId, operation: &ExecutedOperation);
}

/// Handle returned when a listener is attached to a replicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener bookkeeping that concrete replicables embed.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn OperationListener>)>>,
}

impl ListenerSet {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener.
    pub fn add(&self, listener: Arc<dyn OperationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Detach a listener. Returns true if it was attached.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if no listener is attached.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notify every attached listener.
    pub fn notify(&self, replicable_id: &ReplicableId, operation: &ExecutedOperation) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.operation_executed(replicable_id, operation);
        }
    }
}

/// A stateful entity whose mutations are replicated.
///
/// Implementations use interior mutability; the subsystem shares them as `Arc<dyn Replicable>`.
pub trait Replicable: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &ReplicableId;

    /// Write the full state for an initial load.
    fn write_snapshot(&self, out: &mut dyn Write) -> Result<()>;

    /// Replace the full state from a snapshot written by [`Replicable::write_snapshot`].
    fn read_snapshot(&self, input: &mut dyn Read) -> Result<()>;

    /// Drop all state before an initial load.
    fn clear_replica_state(&self);

    /// Decode and execute one operation received from the master.
    fn apply_operation(&self, payload: &[u8]) -> Result<()>;

    /// Attach a listener notified on each locally executed operation.
    fn add_operation_listener(&self, listener: Arc<dyn OperationListener>) -> ListenerId;

    /// Detach a listener. Returns true if it was attached.
    fn remove_operation_listener(&self, listener: ListenerId) -> bool;

    /// This replicable now receives its state from `master`.
    fn started_replicating_from(&self, _master: &MasterDescriptor) {}

    /// This replicable no longer receives its state from `master`.
    fn stopped_replicating_from(&self, _master: &MasterDescriptor) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, &'static str)>>,
    }

    impl OperationListener for Recorder {
        fn operation_executed(&self, replicable_id: &ReplicableId, operation: &ExecutedOperation) {
            self.seen
                .lock()
                .push((replicable_id.to_string(), operation.type_tag));
        }
    }

    #[test]
    fn test_replicable_id_display_and_conversions() {
        let id = ReplicableId::from("race-1");
        assert_eq!(id.as_str(), "race-1");
        assert_eq!(id.to_string(), "race-1");
        assert_eq!(id, ReplicableId::new(String::from("race-1")));
    }

    #[test]
    fn test_listener_set_add_notify_remove() {
        let set = ListenerSet::new();
        let recorder = Arc::new(Recorder::default());
        let id = set.add(recorder.clone());
        assert_eq!(set.len(), 1);

        let op = ExecutedOperation::new("Put", vec![1, 2, 3]);
        set.notify(&ReplicableId::from("race-1"), &op);
        assert_eq!(recorder.seen.lock().len(), 1);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());

        set.notify(&ReplicableId::from("race-1"), &op);
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn test_listener_ids_are_distinct() {
        let set = ListenerSet::new();
        let a = set.add(Arc::new(Recorder::default()));
        let b = set.add(Arc::new(Recorder::default()));
        assert_ne!(a, b);
        assert!(set.remove(a));
        assert_eq!(set.len(), 1);
    }
}
