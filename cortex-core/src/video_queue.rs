//! Bounded hand-off of received video datagrams.
//!
//! The receive task pushes, the tick loop pops one access unit per
//! tick. When the decoder falls behind the oldest unit is dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::lock;

/// Default number of buffered access units.
pub const DEFAULT_DEPTH: usize = 64;

#[derive(Debug)]
pub struct AccessUnitQueue {
    units: Mutex<VecDeque<Bytes>>,
    capacity: usize,
}

impl AccessUnitQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            units: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a unit. Returns `true` when an older unit had to go.
    pub fn push(&self, unit: Bytes) -> bool {
        let mut units = lock(&self.units);
        let dropped = units.len() >= self.capacity;
        if dropped {
            units.pop_front();
        }
        units.push_back(unit);
        dropped
    }

    pub fn pop(&self) -> Option<Bytes> {
        lock(&self.units).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.units).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.units).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.units).clear();
    }
}

impl Default for AccessUnitQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_drop_oldest() {
        let q = AccessUnitQueue::new(2);
        assert!(!q.push(Bytes::from_static(b"a")));
        assert!(!q.push(Bytes::from_static(b"b")));
        assert!(q.push(Bytes::from_static(b"c")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().as_deref(), Some(&b"b"[..]));
        assert_eq!(q.pop().as_deref(), Some(&b"c"[..]));
        assert!(q.pop().is_none());
    }
}
