//! Rekon store: the per-run change-capture store, the multi-revision object store and
//! a coalescing work queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashMap;

mod capture;
mod revision;

pub use capture::{ChangeCaptureStore, DescriptionFormatter};
pub use revision::{NamespacedName, ObjectRevisionStore};

/// Coalescing queue keyed by `K` with FIFO order and fixed capacity. Pushing an
/// already-queued key replaces its value in place; pushing past capacity drops the
/// oldest key.
pub struct Coalescer<K, V> {
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
    cap: usize,
    dropped: u64,
}

impl<K: Eq + Hash + Clone, V> Coalescer<K, V> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Returns true when a new key was queued, false when an existing one was coalesced.
    pub fn push(&mut self, key: K, value: V) -> bool {
        let fresh = !self.map.contains_key(&key);
        if fresh {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
        fresh
    }

    pub fn pop(&mut self) -> Option<(K, V)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(v) = self.map.remove(&key) {
                return Some((key, v));
            }
        }
        None
    }

    pub fn drain_ready(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(kv) = self.pop() {
            out.push(kv);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescer_keeps_latest_value_in_first_seen_order() {
        let mut c = Coalescer::with_capacity(8);
        assert!(c.push("a", 1));
        assert!(c.push("b", 1));
        assert!(!c.push("a", 2));
        assert_eq!(c.len(), 2);
        assert_eq!(c.drain_ready(), vec![("a", 2), ("b", 1)]);
        assert!(c.is_empty());
    }

    #[test]
    fn coalescer_drops_oldest_past_capacity() {
        let mut c = Coalescer::with_capacity(2);
        c.push(1, ());
        c.push(2, ());
        c.push(3, ());
        assert_eq!(c.dropped(), 1);
        assert_eq!(c.pop().map(|(k, _)| k), Some(2));
        assert_eq!(c.pop().map(|(k, _)| k), Some(3));
        assert_eq!(c.pop(), None);
    }
}
