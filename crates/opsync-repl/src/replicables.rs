//! Replicables known to this instance, keyed by ID.

use crate::operation::{Replicable, ReplicableId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Observes replicables being added to or removed from a [`ReplicableRegistry`].
pub trait ReplicableLifecycleListener: Send + Sync {
    /// `replicable` became available.
    fn replicable_added(&self, replicable: &Arc<dyn Replicable>);

    /// The replicable with `replicable_id` was removed.
    fn replicable_removed(&self, replicable_id: &ReplicableId);
}

/// Registry of the replicables hosted by this instance.
#[derive(Default)]
pub struct ReplicableRegistry {
    replicables: RwLock<BTreeMap<ReplicableId, Arc<dyn Replicable>>>,
    listeners: RwLock<Vec<Arc<dyn ReplicableLifecycleListener>>>,
}

impl ReplicableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a replicable. A replicable with the same ID is replaced.
    pub fn add(&self, replicable: Arc<dyn Replicable>) {
        let id = replicable.id().clone();
        let replaced = self
            .replicables
            .write()
            .insert(id.clone(), Arc::clone(&replicable));
        if replaced.is_some() {
            warn!(replicable = %id, "replicable replaced by a new instance");
            self.notify_removed(&id);
        }
        debug!(replicable = %id, "replicable added");
        for listener in self.listeners.read().clone() {
            listener.replicable_added(&replicable);
        }
    }

    /// Remove a replicable.
    pub fn remove(&self, replicable_id: &ReplicableId) -> Option<Arc<dyn Replicable>> {
        let removed = self.replicables.write().remove(replicable_id);
        if removed.is_some() {
            debug!(replicable = %replicable_id, "replicable removed");
            self.notify_removed(replicable_id);
        }
        removed
    }

    /// Look up a replicable.
    pub fn get(&self, replicable_id: &ReplicableId) -> Option<Arc<dyn Replicable>> {
        self.replicables.read().get(replicable_id).cloned()
    }

    /// All replicables, ordered by ID.
    pub fn all(&self) -> Vec<Arc<dyn Replicable>> {
        self.replicables.read().values().cloned().collect()
    }

    /// IDs of all replicables, ordered.
    pub fn ids(&self) -> Vec<ReplicableId> {
        self.replicables.read().keys().cloned().collect()
    }

    /// Number of replicables.
    pub fn len(&self) -> usize {
        self.replicables.read().len()
    }

    /// Returns true if no replicable is registered.
    pub fn is_empty(&self) -> bool {
        self.replicables.read().is_empty()
    }

    /// Observe future additions and removals.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn ReplicableLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    fn notify_removed(&self, replicable_id: &ReplicableId) {
        for listener in self.listeners.read().clone() {
            listener.replicable_removed(replicable_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValueStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ReplicableLifecycleListener for Events {
        fn replicable_added(&self, replicable: &Arc<dyn Replicable>) {
            self.0.lock().push(format!("+{}", replicable.id()));
        }

        fn replicable_removed(&self, replicable_id: &ReplicableId) {
            self.0.lock().push(format!("-{}", replicable_id));
        }
    }

    #[test]
    fn test_add_get_remove() {
        let registry = ReplicableRegistry::new();
        registry.add(Arc::new(KeyValueStore::new("b")));
        registry.add(Arc::new(KeyValueStore::new("a")));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.ids(),
            vec![ReplicableId::from("a"), ReplicableId::from("b")]
        );
        assert!(registry.get(&"a".into()).is_some());
        assert!(registry.remove(&"a".into()).is_some());
        assert!(registry.remove(&"a".into()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lifecycle_events() {
        let registry = ReplicableRegistry::new();
        let events = Arc::new(Events::default());
        registry.add_lifecycle_listener(events.clone());

        registry.add(Arc::new(KeyValueStore::new("race-1")));
        registry.add(Arc::new(KeyValueStore::new("race-1")));
        registry.remove(&"race-1".into());

        assert_eq!(
            *events.0.lock(),
            vec!["+race-1", "-race-1", "+race-1", "-race-1"]
        );
    }
}
