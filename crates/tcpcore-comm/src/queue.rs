//! Bounded, mutex-guarded cross-thread queue.
//!
//! Carries the producer/consumer shape of the shared-memory ring this is
//! grounded on, but none of its cross-process plumbing: every queue here is
//! intra-process, so a plain heap-backed `VecDeque` behind one `Mutex` is
//! enough. The command queues an engine drains each tick (connect/send/ack/
//! close/reset/destroy) and the epoll readiness queue both use this type.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::QueueError;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

/// A bounded MPSC-shaped queue. Cheap to clone; clones share the same
/// backing ring.
#[derive(Clone)]
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner { items: Mutex::new(VecDeque::with_capacity(capacity)), capacity }),
        }
    }

    /// Pushes `item`, returning it back as `Err` if the queue is at capacity.
    pub fn try_push(&self, item: T) -> Result<(), (T, QueueError)> {
        let mut items = self.inner.items.lock().unwrap();
        if items.len() >= self.inner.capacity {
            return Err((item, QueueError::Full));
        }
        items.push_back(item);
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.items.lock().unwrap().pop_front()
    }

    /// Drains every currently-queued item into `f`, in FIFO order. Used by an
    /// engine tick to empty a command queue without holding the lock across
    /// the handler calls.
    pub fn drain_into<F: FnMut(T)>(&self, mut f: F) {
        let drained: Vec<T> = {
            let mut items = self.inner.items.lock().unwrap();
            items.drain(..).collect()
        };
        for item in drained {
            f(item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo_order() {
        let q = Queue::bounded(4);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn rejects_past_capacity() {
        let q = Queue::bounded(2);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        let err = q.try_push(3).unwrap_err();
        assert_eq!(err.0, 3);
        assert_eq!(err.1, QueueError::Full);
    }

    #[test]
    fn drain_into_empties_in_order() {
        let q = Queue::bounded(4);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        q.try_push(3).unwrap();
        let mut seen = Vec::new();
        q.drain_into(|v| seen.push(v));
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn shared_across_threads() {
        let q: Queue<usize> = Queue::bounded(64);
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..32 {
                while producer.try_push(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });
        handle.join().unwrap();
        assert_eq!(q.len(), 32);
    }
}
