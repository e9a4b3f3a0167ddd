//! Per-thread correlation of in-flight operations
//!
//! An entry hook sees the call arguments, the matching exit hook only sees
//! the result. The entry hook stashes a handle in the slot of the calling
//! thread and the exit hook takes it back out. A thread runs one
//! intercepted operation at a time, so a slot holds at most one handle and
//! is valid only between a thread's entry and exit.

use parking_lot::Mutex;
use tracing::debug;

/// Fixed-capacity table indexed directly by thread id
pub struct InflightTable<T> {
    slots: Box<[Mutex<Option<T>>]>,
}

impl<T> InflightTable<T> {
    /// Table covering thread ids `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Stash the handle of the calling thread's operation, replacing any
    /// previous one. Ids outside the table are ignored and return false.
    pub fn record_inflight(&self, tid: u32, handle: T) -> bool {
        match self.slot(tid) {
            Some(slot) => {
                *slot.lock() = Some(handle);
                true
            }
            None => {
                debug!(tid, capacity = self.capacity(), "thread id out of range");
                false
            }
        }
    }

    /// Read and clear the calling thread's slot
    pub fn take_inflight(&self, tid: u32) -> Option<T> {
        self.slot(tid)?.lock().take()
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    fn slot(&self, tid: u32) -> Option<&Mutex<Option<T>>> {
        usize::try_from(tid).ok().and_then(|i| self.slots.get(i))
    }
}

impl<T> std::fmt::Debug for InflightTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTable")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_clears_slot() {
        let table = InflightTable::new(16);
        table.record_inflight(3, "sock");
        assert_eq!(table.occupied(), 1);
        assert_eq!(table.take_inflight(3), Some("sock"));
        assert_eq!(table.take_inflight(3), None);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_record_overwrites() {
        let table = InflightTable::new(16);
        table.record_inflight(5, 1);
        table.record_inflight(5, 2);
        assert_eq!(table.take_inflight(5), Some(2));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let table = InflightTable::new(4);
        assert!(!table.record_inflight(4, 1));
        assert!(!table.record_inflight(u32::MAX, 1));
        assert!(table.record_inflight(3, 1));
        table.take_inflight(3);
        assert_eq!(table.take_inflight(4), None);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_threads_use_own_slots() {
        let table = Arc::new(InflightTable::new(64));
        let workers: Vec<_> = (0..8u32)
            .map(|tid| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for round in 0..1000u32 {
                        table.record_inflight(tid, (tid, round));
                        assert_eq!(table.take_inflight(tid), Some((tid, round)));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(table.occupied(), 0);
    }
}
