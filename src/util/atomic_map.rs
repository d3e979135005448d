use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map for data that is read far more often than it is modified: readers get a
///  consistent snapshot without holding a lock while they work on it, and updates replace the
///  whole map.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut lock = self.map.write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut map: FxHashMap<K,V> = (**lock).clone();
        let result = f(&mut map);
        *lock = Arc::new(map);
        result
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(None, map.get(&2));
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_updates() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(1, 1); });

        let snapshot = map.load();
        map.update(|m| {
            m.remove(&1);
            m.insert(2, 2);
        });

        assert_eq!(snapshot.get(&1), Some(&1));
        assert!(snapshot.get(&2).is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&2), Some(2));
    }

    #[test]
    fn test_update_returns_closure_result() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(7, 8); });

        let removed = map.update(|m| m.remove(&7));
        assert_eq!(removed, Some(8));
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());

        let handles = (0..8u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.update(|m| { m.insert(t * 1000 + i, i); });
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), 800);
    }
}
