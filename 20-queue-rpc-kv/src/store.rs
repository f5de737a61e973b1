//! In-memory key-value storage behind the RPC server.
//!
//! The store remembers the order in which keys were first inserted and
//! exposes it through [`KvStore::list_all`]. Overwriting a key keeps its
//! position; removing and re-adding it moves it to the end.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe, insertion-ordered key-value store.
///
/// Every operation, reads included, runs under one exclusive lock. There is
/// no per-key locking and no reader/writer split: a `list_all` over a large
/// store holds up every other request until it has copied the entries out.
#[derive(Default)]
pub struct KvStore {
    inner: Mutex<OrderedMap>,
}

#[derive(Default)]
struct OrderedMap {
    /// key -> (insertion sequence, value)
    values: HashMap<String, (u64, String)>,
    /// insertion sequence -> key, iterated for ordering
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl KvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`.
    ///
    /// A new key is appended to the iteration order. An existing key keeps
    /// its position and only has its value replaced.
    pub fn set(&self, key: String, value: String) {
        let mut map = self.lock();
        if let Some((_, slot)) = map.values.get_mut(&key) {
            *slot = value;
            return;
        }

        let seq = map.next_seq;
        map.next_seq += 1;
        map.order.insert(seq, key.clone());
        map.values.insert(key, (seq, value));
    }

    /// Removes `key`. Absent keys are ignored.
    pub fn delete(&self, key: &str) {
        let mut map = self.lock();
        if let Some((seq, _)) = map.values.remove(key) {
            map.order.remove(&seq);
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).map(|(_, value)| value.clone())
    }

    /// Returns every entry in first-insertion order.
    ///
    /// The copy is taken under the lock, so it never reflects half of a
    /// concurrent mutation.
    pub fn list_all(&self) -> Vec<(String, String)> {
        let map = self.lock();
        map.order
            .values()
            .filter_map(|key| {
                map.values
                    .get(key)
                    .map(|(_, value)| (key.clone(), value.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Each mutation finishes before its guard drops, so a poisoned map is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, OrderedMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn list_all_follows_first_insertion_order() {
        let store = KvStore::new();
        store.set("c".into(), "3".into());
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());

        assert_eq!(store.list_all(), entries(&[("c", "3"), ("a", "1"), ("b", "2")]));
    }

    #[test]
    fn overwrite_keeps_position() {
        let store = KvStore::new();
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.set("a".into(), "10".into());

        assert_eq!(store.list_all(), entries(&[("a", "10"), ("b", "2")]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reinsert_after_delete_moves_to_end() {
        let store = KvStore::new();
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.delete("a");
        store.set("a".into(), "3".into());

        assert_eq!(store.list_all(), entries(&[("b", "2"), ("a", "3")]));
    }

    #[test]
    fn get_after_delete_is_absent() {
        let store = KvStore::new();
        store.set("k".into(), "v".into());
        assert_eq!(store.get("k"), Some("v".to_string()));

        store.delete("k");
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let store = KvStore::new();
        store.set("a".into(), "1".into());
        store.delete("missing");

        assert_eq!(store.list_all(), entries(&[("a", "1")]));
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let store = Arc::new(KvStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100 {
                        store.set(format!("{t}-{i}"), i.to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_eq!(store.len(), 800);
        assert_eq!(store.list_all().len(), 800);
    }
}
