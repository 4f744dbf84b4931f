//! A keyed register store, the replicable used by the demo and the tests.

use crate::descriptor::MasterDescriptor;
use crate::error::{ReplError, Result};
use crate::operation::{
    ExecutedOperation, ListenerId, ListenerSet, Operation, OperationListener, Replicable,
    ReplicableId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Store contents.
pub type StoreState = BTreeMap<String, i64>;

/// Mutation of a [`KeyValueStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Set `key` to `value`.
    Put {
        /// Key to set.
        key: String,
        /// New value.
        value: i64,
    },
    /// Delete `key`.
    Remove {
        /// Key to delete.
        key: String,
    },
}

impl Operation for StoreOp {
    type State = StoreState;
    type Output = Option<i64>;

    fn execute_locally(&self, state: &mut StoreState) -> Option<i64> {
        match self {
            StoreOp::Put { key, value } => state.insert(key.clone(), *value),
            StoreOp::Remove { key } => state.remove(key),
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            StoreOp::Put { .. } => "Put",
            StoreOp::Remove { .. } => "Remove",
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, self)?;
        Ok(())
    }
}

/// Replicable map from string keys to integers.
pub struct KeyValueStore {
    id: ReplicableId,
    state: RwLock<StoreState>,
    listeners: ListenerSet,
    replicating_from: Mutex<Option<String>>,
}

impl KeyValueStore {
    /// Create an empty store.
    pub fn new(id: impl Into<ReplicableId>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(StoreState::new()),
            listeners: ListenerSet::new(),
            replicating_from: Mutex::new(None),
        }
    }

    /// Set `key` to `value`; returns the previous value.
    pub fn put(&self, key: &str, value: i64) -> Result<Option<i64>> {
        self.execute(StoreOp::Put {
            key: key.to_string(),
            value,
        })
    }

    /// Delete `key`; returns the removed value.
    pub fn remove(&self, key: &str) -> Result<Option<i64>> {
        self.execute(StoreOp::Remove {
            key: key.to_string(),
        })
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.state.read().get(key).copied()
    }

    /// Copy of the full contents.
    pub fn contents(&self) -> StoreState {
        self.state.read().clone()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Returns true if the store holds no key.
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Key of the master this store currently replicates from.
    pub fn replicating_from(&self) -> Option<String> {
        self.replicating_from.lock().clone()
    }

    /// Number of attached operation listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Execute `op` and notify listeners. Listeners run under the state lock so their
    /// notification order matches execution order.
    pub fn execute(&self, op: StoreOp) -> Result<Option<i64>> {
        let executed = ExecutedOperation::encode(&op)?;
        let mut state = self.state.write();
        let output = op.execute_locally(&mut state);
        self.listeners.notify(&self.id, &executed);
        Ok(output)
    }
}

impl Replicable for KeyValueStore {
    fn id(&self) -> &ReplicableId {
        &self.id
    }

    fn write_snapshot(&self, out: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(out, &*self.state.read()).map_err(|e| ReplError::Snapshot {
            replicable_id: self.id.to_string(),
            msg: e.to_string(),
        })
    }

    fn read_snapshot(&self, input: &mut dyn Read) -> Result<()> {
        let restored: StoreState =
            bincode::deserialize_from(input).map_err(|e| ReplError::Snapshot {
                replicable_id: self.id.to_string(),
                msg: e.to_string(),
            })?;
        *self.state.write() = restored;
        Ok(())
    }

    fn clear_replica_state(&self) {
        self.state.write().clear();
    }

    fn apply_operation(&self, payload: &[u8]) -> Result<()> {
        let op: StoreOp = bincode::deserialize(payload).map_err(|e| ReplError::Apply {
            replicable_id: self.id.to_string(),
            msg: e.to_string(),
        })?;
        self.execute(op)?;
        Ok(())
    }

    fn add_operation_listener(&self, listener: Arc<dyn OperationListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_operation_listener(&self, listener: ListenerId) -> bool {
        self.listeners.remove(listener)
    }

    fn started_replicating_from(&self, master: &MasterDescriptor) {
        *self.replicating_from.lock() = Some(master.key());
    }

    fn stopped_replicating_from(&self, _master: &MasterDescriptor) {
        *self.replicating_from.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<ExecutedOperation>>);

    impl OperationListener for Capture {
        fn operation_executed(&self, _replicable_id: &ReplicableId, operation: &ExecutedOperation) {
            self.0.lock().push(operation.clone());
        }
    }

    #[test]
    fn test_put_and_remove() {
        let store = KeyValueStore::new("race-1");
        assert_eq!(store.put("x", 1).unwrap(), None);
        assert_eq!(store.put("x", 2).unwrap(), Some(1));
        assert_eq!(store.get("x"), Some(2));
        assert_eq!(store.remove("x").unwrap(), Some(2));
        assert!(store.is_empty());
    }

    #[test]
    fn test_listeners_see_encoded_operations() {
        let store = KeyValueStore::new("race-1");
        let capture = Arc::new(Capture::default());
        let id = store.add_operation_listener(capture.clone());
        store.put("x", 1).unwrap();
        store.remove("x").unwrap();

        let seen = capture.0.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].type_tag, "Put");
        assert_eq!(seen[1].type_tag, "Remove");

        assert!(store.remove_operation_listener(id));
        store.put("y", 1).unwrap();
        assert_eq!(capture.0.lock().len(), 2);
    }

    #[test]
    fn test_apply_replays_encoded_operation() {
        let master = KeyValueStore::new("race-1");
        let replica = KeyValueStore::new("race-1");
        let capture = Arc::new(Capture::default());
        master.add_operation_listener(capture.clone());
        master.put("x", 1).unwrap();
        master.put("x", 2).unwrap();

        for op in capture.0.lock().iter() {
            replica.apply_operation(&op.payload).unwrap();
        }
        assert_eq!(replica.contents(), master.contents());
    }

    #[test]
    fn test_apply_garbage_fails() {
        let store = KeyValueStore::new("race-1");
        let err = store.apply_operation(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, ReplError::Apply { .. }));
    }

    #[test]
    fn test_snapshot_replaces_state() {
        let source = KeyValueStore::new("race-1");
        source.put("a", 1).unwrap();
        source.put("b", 2).unwrap();
        let mut snapshot = Vec::new();
        source.write_snapshot(&mut snapshot).unwrap();

        let target = KeyValueStore::new("race-1");
        target.put("stale", 9).unwrap();
        target.read_snapshot(&mut snapshot.as_slice()).unwrap();
        assert_eq!(target.contents(), source.contents());
    }
}
