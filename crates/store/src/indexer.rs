use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use beacon_core::WatchKey;
use rustc_hash::FxHashMap;

/// Last-seen state of one watched resource type, keyed by [`WatchKey`].
///
/// Cheap to clone; clones share the same map. The owning informer is the only writer,
/// everyone else reads.
pub struct Indexer<T> {
    items: Arc<RwLock<FxHashMap<WatchKey, Arc<T>>>>,
}

impl<T> Clone for Indexer<T> {
    fn clone(&self) -> Self { Self { items: Arc::clone(&self.items) } }
}

impl<T> Default for Indexer<T> {
    fn default() -> Self { Self { items: Arc::new(RwLock::new(FxHashMap::default())) } }
}

impl<T> Indexer<T> {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<WatchKey, Arc<T>>> { self.items.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<WatchKey, Arc<T>>> { self.items.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, key: &WatchKey) -> Option<Arc<T>> { self.read().get(key).cloned() }
    pub fn contains(&self, key: &WatchKey) -> bool { self.read().contains_key(key) }
    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    /// All objects ordered by key.
    pub fn list(&self) -> Vec<Arc<T>> {
        let guard = self.read();
        let mut entries: Vec<(&WatchKey, &Arc<T>)> = guard.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, v)| Arc::clone(v)).collect()
    }

    pub fn keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Insert or replace; returns the previous object.
    pub fn upsert(&self, key: WatchKey, obj: T) -> Option<Arc<T>> { self.write().insert(key, Arc::new(obj)) }

    pub fn remove(&self, key: &WatchKey) -> Option<Arc<T>> { self.write().remove(key) }

    /// Swap in a full listing; returns what was there before.
    pub fn replace(&self, items: Vec<(WatchKey, T)>) -> FxHashMap<WatchKey, Arc<T>> {
        let next: FxHashMap<WatchKey, Arc<T>> = items.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        std::mem::replace(&mut *self.write(), next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state_and_list_is_key_ordered() {
        let idx: Indexer<u32> = Indexer::new();
        let reader = idx.clone();
        idx.upsert(WatchKey::namespaced("b", "x"), 2);
        idx.upsert(WatchKey::namespaced("a", "x"), 1);
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.list().iter().map(|v| **v).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(idx.upsert(WatchKey::namespaced("a", "x"), 3).map(|v| *v), Some(1));
        assert_eq!(reader.get(&WatchKey::namespaced("a", "x")).map(|v| *v), Some(3));
    }

    #[test]
    fn replace_returns_previous_contents() {
        let idx: Indexer<&str> = Indexer::new();
        idx.upsert(WatchKey::cluster("old"), "o");
        let prev = idx.replace(vec![(WatchKey::cluster("new"), "n")]);
        assert!(prev.contains_key(&WatchKey::cluster("old")));
        assert_eq!(idx.keys(), vec![WatchKey::cluster("new")]);
        assert!(idx.remove(&WatchKey::cluster("new")).is_some());
        assert!(idx.is_empty());
    }
}
