//! Deduplicating bounded queue
//!
//! FIFO of unique connection targets. A duplicate push is refused; pushing
//! past capacity evicts exactly the oldest entry. Safe to call from
//! multiple threads (single internal lock).

use linked_hash_set::LinkedHashSet;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Capacity-bounded FIFO with uniqueness.
///
/// Backed by an insertion-ordered set: `contains` and `len` are O(1),
/// eviction order is strictly insertion order (not access order).
#[derive(Debug)]
pub struct ConnectQueue<T: Hash + Eq> {
    capacity: NonZeroUsize,
    inner: Mutex<LinkedHashSet<T>>,
}

impl<T: Hash + Eq> ConnectQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LinkedHashSet::new()),
        }
    }

    /// Insert at the back unless already present.
    ///
    /// Returns whether the item was inserted. When the queue is at
    /// capacity, a successful insertion evicts exactly the oldest entry;
    /// a refused duplicate evicts nothing and keeps its original position.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.insert(item) {
            return false;
        }
        if inner.len() > self.capacity.get() {
            inner.pop_front();
        }
        true
    }

    /// Remove and return the oldest entry
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner.lock().unwrap().contains(item)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}
