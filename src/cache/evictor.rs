//! Eviction policy: least recently used, skipping protected entries.
//!
//! Caches record a tick on every access. Victim selection walks the entries
//! oldest first and skips anything the caller reports as protected (pinned
//! by an outstanding `Arc`, or still loading).

use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// An eviction candidate. Older ticks pop first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate<K> {
    pub key: K,
    pub last_used: u64,
}

impl<K: Eq> PartialOrd for EvictionCandidate<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Eq> Ord for EvictionCandidate<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.last_used.cmp(&self.last_used)
    }
}

/// Recency bookkeeping for one cache.
#[derive(Debug)]
pub struct LruTracker<K> {
    tick: u64,
    last_used: HashMap<K, u64>,
}

impl<K: Eq + Hash + Clone> Default for LruTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LruTracker<K> {
    pub fn new() -> Self {
        Self {
            tick: 0,
            last_used: HashMap::new(),
        }
    }

    /// Mark `key` as most recently used, inserting it if absent.
    pub fn touch(&mut self, key: &K) {
        self.tick += 1;
        match self.last_used.get_mut(key) {
            Some(tick) => *tick = self.tick,
            None => {
                self.last_used.insert(key.clone(), self.tick);
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.last_used.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.last_used.contains_key(key)
    }

    pub fn last_used(&self, key: &K) -> Option<u64> {
        self.last_used.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.last_used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_used.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_used.clear();
    }

    /// Up to `count` unprotected keys, least recently used first.
    pub fn select_victims(&self, count: usize, is_protected: impl Fn(&K) -> bool) -> Vec<K> {
        let mut heap: BinaryHeap<EvictionCandidate<K>> = self
            .last_used
            .iter()
            .filter(|(key, _)| !is_protected(*key))
            .map(|(key, &last_used)| EvictionCandidate {
                key: key.clone(),
                last_used,
            })
            .collect();

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate.key),
                None => break,
            }
        }
        victims
    }

    /// The least recently used unprotected key.
    pub fn lru(&self, is_protected: impl Fn(&K) -> bool) -> Option<K> {
        self.last_used
            .iter()
            .filter(|(key, _)| !is_protected(*key))
            .min_by_key(|(_, last_used)| **last_used)
            .map(|(key, _)| key.clone())
    }
}
