use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Map holding at most `capacity` entries. Inserting into a full map evicts
/// the entry written longest ago; rewriting a key makes it the newest.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert, returning the evicted oldest entry if the map was full
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
            self.order.push_back(key);
            return None;
        }
        self.order.push_back(key);

        if self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                return self.entries.remove(&oldest).map(|v| (oldest, v));
            }
        }
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Keep only entries matching the predicate
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let entries = &mut self.entries;
        self.order.retain(|k| {
            let kept = entries.get(k).map_or(false, |v| keep(k, v));
            if !kept {
                entries.remove(k);
            }
            kept
        });
    }

    /// Entries oldest-first
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .iter()
            .filter_map(move |k| self.entries.get(k).map(|v| (k, v)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
