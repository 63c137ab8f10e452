use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Condvar, Mutex},
};

use crate::errors::{Error, Result};

/// Ordered priority levels for queued work. A freshly requested view is
/// submitted as `High` so it overtakes queued background work the moment a
/// worker becomes free. Adding further levels is a matter of adding variants;
/// the queue itself only relies on their ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Heap entry. Ordered by priority first; ties are broken by submission
/// order so equal-priority work cannot starve.
struct Entry<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// A thread-safe priority queue shared between producers (the scheduler) and
/// consumers (local pool workers and the remote dispatcher). Any number of
/// both may call concurrently; no item is ever returned twice or lost.
pub struct ConcurrentPriorityQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    capacity: Option<usize>,
}

impl<T> ConcurrentPriorityQueue<T> {
    /// Creates an unbounded queue; `enqueue` always succeeds
    pub fn new() -> Self {
        Self::with_bound(None)
    }

    /// Creates a queue that refuses items beyond `capacity` with
    /// `Error::QueueFull`. Producers get the backpressure signal immediately
    /// instead of being blocked.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_bound(Some(capacity))
    }

    fn with_bound(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn enqueue(&self, item: T, priority: Priority) -> Result<()> {
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        if let Some(capacity) = self.capacity {
            if inner.heap.len() >= capacity {
                return Err(Error::QueueFull);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority,
            seq,
            item,
        });
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns the highest-priority item if one is available
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        inner.heap.pop().map(|entry| entry.item)
    }

    /// Blocks the calling worker until an item is available or the queue is
    /// closed. Remaining items are drained before `None` is returned.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        loop {
            if let Some(entry) = inner.heap.pop() {
                return Some(entry.item);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("This is not expected to fail");
        }
    }

    /// Wakes all blocked consumers; subsequent blocking dequeues return
    /// `None` once the queue has drained
    pub fn close(&self) {
        self.inner
            .lock()
            .expect("This is not expected to fail")
            .closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("This is not expected to fail")
            .heap
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ConcurrentPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn high_priority_wins() {
        let queue = ConcurrentPriorityQueue::new();
        queue.enqueue("low_0", Priority::Low).unwrap();
        queue.enqueue("high_0", Priority::High).unwrap();
        queue.enqueue("low_1", Priority::Low).unwrap();
        queue.enqueue("normal_0", Priority::Normal).unwrap();
        queue.enqueue("high_1", Priority::High).unwrap();

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(
            drained,
            ["high_0", "high_1", "normal_0", "low_0", "low_1"]
        );
    }

    #[test]
    fn fifo_within_one_level() {
        let queue = ConcurrentPriorityQueue::new();
        for i in 0..100 {
            queue.enqueue(i, Priority::Normal).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn bounded_queue_signals_backpressure() {
        let queue = ConcurrentPriorityQueue::bounded(2);
        queue.enqueue(1, Priority::Normal).unwrap();
        queue.enqueue(2, Priority::Normal).unwrap();
        assert!(matches!(
            queue.enqueue(3, Priority::High),
            Err(Error::QueueFull)
        ));

        // Draining frees capacity again
        assert_eq!(queue.try_dequeue(), Some(1));
        queue.enqueue(3, Priority::High).unwrap();
    }

    #[test]
    fn try_dequeue_returns_none_when_empty() {
        let queue = ConcurrentPriorityQueue::<u32>::new();
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn blocking_dequeue_waits_for_work() {
        let queue = Arc::new(ConcurrentPriorityQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue())
        };
        thread::sleep(Duration::from_millis(50));
        queue.enqueue(42, Priority::Low).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn close_releases_blocked_consumers() {
        let queue = Arc::new(ConcurrentPriorityQueue::<u32>::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        queue.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }
}
