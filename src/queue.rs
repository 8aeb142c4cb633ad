//! Cross-thread handoff queue.
//!
//! Producers on any thread append without blocking; the owning scheduling
//! thread drains everything pending once per tick. Built on crossbeam's
//! segmented queue, so neither side takes a lock. There is no backpressure:
//! exceeding the soft limit only produces a warning, once per overflow episode.

use crossbeam::queue::SegQueue;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct HandoffQueue<T> {
    queue: SegQueue<T>,
    soft_limit: usize,
    label: &'static str,
    overflowing: AtomicBool,
}

impl<T> HandoffQueue<T> {
    pub fn new(label: &'static str, soft_limit: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            soft_limit,
            label,
            overflowing: AtomicBool::new(false),
        }
    }

    /// Appends an item. Never blocks.
    pub fn push(&self, item: T) {
        self.queue.push(item);
        let depth = self.queue.len();
        if depth > self.soft_limit && !self.overflowing.swap(true, Ordering::Relaxed) {
            warn!(
                "{}: {} entries pending (soft limit {}), consumer is starved or overloaded",
                self.label, depth, self.soft_limit
            );
        }
    }

    /// Removes and yields the items pending at call time, oldest first.
    ///
    /// Items pushed while draining are left for the next drain, so a busy
    /// producer cannot keep the consumer here.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain {
            owner: self,
            remaining: self.queue.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }
}

pub struct Drain<'a, T> {
    owner: &'a HandoffQueue<T>,
    remaining: usize,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining > 0 {
            if let Some(item) = self.owner.queue.pop() {
                self.remaining -= 1;
                return Some(item);
            }
            self.remaining = 0;
        }
        if self.owner.queue.is_empty() {
            // Episode over, the next overflow gets reported again.
            self.owner.overflowing.store(false, Ordering::Relaxed);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_preserves_order() {
        let queue = HandoffQueue::new("test", 16);
        for i in 0..10 {
            queue.push(i);
        }
        let drained: Vec<_> = queue.drain().collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_does_not_drop_items() {
        let queue = HandoffQueue::new("test", 4);
        for i in 0..50 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 50);
        assert!(queue.overflowing.load(Ordering::Relaxed));
        assert_eq!(queue.drain().count(), 50);
        assert!(!queue.overflowing.load(Ordering::Relaxed));
    }

    #[test]
    fn drain_stops_at_items_pending_when_it_started() {
        let queue = HandoffQueue::new("test", 16);
        for i in 0..3 {
            queue.push(i);
        }
        let mut drained = Vec::new();
        for item in queue.drain() {
            drained.push(item);
            queue.push(item + 10);
        }
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(queue.drain().collect::<Vec<_>>(), vec![10, 11, 12]);
    }

    #[test]
    fn overflow_episode_lasts_until_queue_is_empty() {
        let queue = HandoffQueue::new("test", 2);
        for i in 0..4 {
            queue.push(i);
        }
        let mut drain = queue.drain();
        assert_eq!(drain.next(), Some(0));
        queue.push(4);
        assert_eq!(drain.by_ref().count(), 3);
        assert!(queue.overflowing.load(Ordering::Relaxed));
        assert_eq!(queue.drain().collect::<Vec<_>>(), vec![4]);
        assert!(!queue.overflowing.load(Ordering::Relaxed));
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        let queue = Arc::new(HandoffQueue::new("test", 10_000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..1000 {
                        queue.push((p, i));
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 4000 {
            received.extend(queue.drain());
            thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }

        // Per-producer order is preserved.
        for p in 0..4 {
            let seq: Vec<_> = received
                .iter()
                .filter(|(id, _)| *id == p)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(seq, (0..1000).collect::<Vec<_>>());
        }
    }
}
