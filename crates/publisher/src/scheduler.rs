//! Deferred actions keyed by owner
//!
//! An indexed binary min-heap: each owner has at most one pending entry,
//! so setting a timer for an owner replaces the previous one. The publisher
//! loop sleeps until [`Scheduler::next_due`] and then drains due entries
//! with [`Scheduler::pop_due`].

use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::Instant;

struct Entry<K, V> {
    due: Instant,
    /// Insertion order; equal due times fire first-set first
    seq: u64,
    key: K,
    value: V,
}

impl<K, V> Entry<K, V> {
    #[inline]
    fn before(&self, other: &Self) -> bool {
        (self.due, self.seq) < (other.due, other.seq)
    }
}

/// One pending `V` per key, ordered by due time
pub struct Scheduler<K, V> {
    heap: Vec<Entry<K, V>>,
    /// Heap position of each key's entry
    index: HashMap<K, usize>,
    seq: u64,
}

impl<K: Hash + Eq + Clone, V> Default for Scheduler<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V> Scheduler<K, V> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    /// Schedule `value` for `key` at `due`, replacing any pending entry
    pub fn set(&mut self, key: K, due: Instant, value: V) {
        self.seq += 1;
        let entry = Entry {
            due,
            seq: self.seq,
            key: key.clone(),
            value,
        };

        match self.index.get(&key) {
            Some(&pos) => {
                self.heap[pos] = entry;
                let pos = self.sift_up(pos);
                self.sift_down(pos);
            }
            None => {
                self.heap.push(entry);
                let pos = self.heap.len() - 1;
                self.index.insert(key, pos);
                self.sift_up(pos);
            }
        }
    }

    /// Cancel the entry for `key`, if any
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.index.remove(key)?;
        let last = self.heap.len() - 1;
        self.swap(pos, last);
        let entry = self.heap.pop()?;
        if pos < self.heap.len() {
            // swap() repointed the index for the moved entry at `pos`
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(entry.value)
    }

    /// Earliest due time
    #[inline]
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.first().map(|e| e.due)
    }

    /// Remove and return the earliest entry if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(K, V)> {
        if self.heap.first()?.due > now {
            return None;
        }
        let key = self.heap[0].key.clone();
        let value = self.remove(&key)?;
        Some((key, value))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Pending entry for `key`
    pub fn get(&self, key: &K) -> Option<(Instant, &V)> {
        self.index.get(key).map(|&pos| {
            let entry = &self.heap[pos];
            (entry.due, &entry.value)
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        if let Some(slot) = self.index.get_mut(&self.heap[a].key) {
            *slot = a;
        }
        if let Some(slot) = self.index.get_mut(&self.heap[b].key) {
            *slot = b;
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].before(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < self.heap.len() && self.heap[left].before(&self.heap[smallest]) {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].before(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
