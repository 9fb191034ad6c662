//! Bounded admission queue ("leaky bucket") between the workers and the drain thread.
//!
//! Producers never block: an insert into a full queue fails immediately and hands the item
//! back, so the caller can still answer the client on the connection it carries. The single
//! consumer blocks in [`AdmissionQueue::dequeue`] until an item arrives or the queue closes.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Why an item was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Full,
    Closed,
}

/// A refused item, returned to the producer untouched.
pub struct Rejected<T> {
    pub reason: RejectReason,
    item: T,
}

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> std::fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity FIFO shared by many producers and one consumer.
///
/// ## Design
/// - `len() <= capacity()` holds at all times; a full queue neither grows nor evicts.
/// - `closed` lives under the same mutex as the items so a close can't race a wait.
/// - Items are moved in and out by value, so an item is enqueued at most once and never
///   re-enters after being dequeued.
pub struct AdmissionQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> AdmissionQueue<T> {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert without blocking; fails if the queue is full or closed.
    pub fn try_enqueue(&self, item: T) -> Result<(), Rejected<T>> {
        let mut g = self.lock();
        if g.closed {
            return Err(Rejected {
                reason: RejectReason::Closed,
                item,
            });
        }
        if g.items.len() >= self.capacity {
            return Err(Rejected {
                reason: RejectReason::Full,
                item,
            });
        }
        g.items.push_back(item);
        drop(g);
        self.cv.notify_one();
        Ok(())
    }

    /// Block until an item is available.
    ///
    /// After [`close`](Self::close), remaining items are still handed out in order; `None`
    /// is returned once the queue is closed and empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut g = self.lock();
        loop {
            if let Some(item) = g.items.pop_front() {
                return Some(item);
            }
            if g.closed {
                return None;
            }
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further inserts and wake the consumer.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Drop everything still queued, returning how many items were discarded.
    pub fn discard(&self) -> usize {
        let drained: Vec<T> = self.lock().items.drain(..).collect();
        // Item destructors (socket close) run outside the lock.
        let count = drained.len();
        drop(drained);
        self.cv.notify_all();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_enqueue_fails_when_full_without_mutating() {
        let q = AdmissionQueue::new(2);
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        assert!(q.is_full());

        let rejected = q.try_enqueue(3).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Full);
        assert_eq!(rejected.into_inner(), 3);
        assert_eq!(q.len(), 2);

        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn never_exceeds_capacity_under_concurrent_producers() {
        let q = Arc::new(AdmissionQueue::new(5));
        let mut handles = Vec::new();
        for t in 0..8 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                let mut accepted = 0usize;
                for i in 0..100 {
                    if q.try_enqueue(t * 1000 + i).is_ok() {
                        accepted += 1;
                    }
                    assert!(q.len() <= q.capacity());
                }
                accepted
            }));
        }
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 5);
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn capacity_plus_one_is_rejected_until_a_slot_frees() {
        let q = AdmissionQueue::new(3);
        for i in 0..3 {
            assert!(q.try_enqueue(i).is_ok());
        }
        assert!(q.try_enqueue(3).is_err());
        assert_eq!(q.dequeue(), Some(0));
        assert!(q.try_enqueue(3).is_ok());
    }

    #[test]
    fn dequeue_is_fifo() {
        let q = AdmissionQueue::new(4);
        for i in 0..4 {
            q.try_enqueue(i).unwrap();
        }
        let out: Vec<_> = (0..4).filter_map(|_| q.dequeue()).collect();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn dequeue_blocks_until_item_arrives() {
        let q = Arc::new(AdmissionQueue::new(1));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        q.try_enqueue("clip").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("clip"));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q: Arc<AdmissionQueue<u32>> = Arc::new(AdmissionQueue::new(1));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn close_drains_remaining_then_rejects() {
        let q = AdmissionQueue::new(2);
        q.try_enqueue(7).unwrap();
        q.close();
        assert_eq!(q.try_enqueue(8).unwrap_err().reason, RejectReason::Closed);
        assert_eq!(q.dequeue(), Some(7));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn discard_empties_queue() {
        let q = AdmissionQueue::new(3);
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        assert_eq!(q.discard(), 2);
        assert!(q.is_empty());
        assert!(!q.is_full());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = AdmissionQueue::new(0);
        assert_eq!(q.capacity(), 1);
        assert!(q.try_enqueue(()).is_ok());
        assert!(q.is_full());
    }
}
