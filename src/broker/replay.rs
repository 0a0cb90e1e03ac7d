//! Fixed-capacity replay history for a single topic.
//!
//! The buffer keeps the `capacity` most recent envelopes in arrival order.
//! Appends are O(1) and never fail: once the buffer is full each insertion
//! overwrites the oldest slot. History is lossy by design, there is no
//! backpressure here.

use std::sync::Arc;

use crate::broker::message::Envelope;

#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    slots: Vec<Option<Arc<Envelope>>>,
    /// Index of the slot the next append writes to.
    head: usize,
    len: usize,
}

impl ReplayBuffer {
    /// Create an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, envelope: Arc<Envelope>) {
        let capacity = self.capacity();
        self.slots[self.head] = Some(envelope);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    /// Up to `n` most recent envelopes, oldest first.
    ///
    /// `n == 0` and `n` larger than the current size both clamp to the
    /// current size, so `recent(0)` returns the whole history.
    pub fn recent(&self, n: usize) -> Vec<Arc<Envelope>> {
        let n = if n == 0 || n > self.len { self.len } else { n };
        let capacity = self.capacity();
        let start = (self.head + capacity - n) % capacity;

        (0..n)
            .filter_map(|i| self.slots[(start + i) % capacity].clone())
            .collect()
    }
}
