//! Fixed-capacity work queue with timed offer/poll semantics.
//!
//! The single point of shared mutable state between the pipeline's producer
//! and its consumers. Capacity bounds memory and provides backpressure;
//! the timed variants let both sides re-check stop conditions periodically
//! instead of blocking indefinitely.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A thread-safe FIFO queue that never holds more than `capacity` items.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Callers validate capacity through
    /// [`PipelineConfig::validate`](crate::config::PipelineConfig::validate)
    /// before construction.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Attempts to enqueue an item, waiting up to `timeout` for space.
    ///
    /// On timeout the item is handed back to the caller so it can retry
    /// after re-checking its stop condition.
    pub fn offer(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        while items.len() >= self.capacity {
            if self.not_full.wait_until(&mut items, deadline).timed_out() {
                if items.len() < self.capacity {
                    break;
                }
                return Err(item);
            }
        }

        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Attempts to dequeue an item, waiting up to `timeout` for one to
    /// arrive.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        while items.is_empty() {
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                if !items.is_empty() {
                    break;
                }
                return None;
            }
        }

        let item = items.pop_front();
        drop(items);
        self.not_full.notify_one();
        item
    }

    /// Returns the number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Returns the fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_offer_then_poll_fifo() {
        let queue = BoundedQueue::new(4);
        assert!(queue.offer(1, SHORT).is_ok());
        assert!(queue.offer(2, SHORT).is_ok());

        assert_eq!(queue.poll(SHORT), Some(1));
        assert_eq!(queue.poll(SHORT), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offer_times_out_when_full() {
        let queue = BoundedQueue::new(2);
        assert!(queue.offer("a", SHORT).is_ok());
        assert!(queue.offer("b", SHORT).is_ok());

        // Full: the rejected item comes back.
        assert_eq!(queue.offer("c", SHORT), Err("c"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_poll_times_out_when_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        assert_eq!(queue.poll(SHORT), None);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let queue = Arc::new(BoundedQueue::new(3));

        std::thread::scope(|scope| {
            let producer_queue = Arc::clone(&queue);
            scope.spawn(move || {
                for i in 0..50u32 {
                    let mut item = i;
                    loop {
                        match producer_queue.offer(item, SHORT) {
                            Ok(()) => break,
                            Err(back) => item = back,
                        }
                    }
                }
            });

            let consumer_queue = Arc::clone(&queue);
            scope.spawn(move || {
                let mut seen = 0;
                while seen < 50 {
                    assert!(consumer_queue.len() <= consumer_queue.capacity());
                    if consumer_queue.poll(SHORT).is_some() {
                        seen += 1;
                    }
                }
            });
        });

        assert!(queue.is_empty());
    }

    #[test]
    fn test_blocked_offer_wakes_on_poll() {
        let queue = Arc::new(BoundedQueue::new(1));
        assert!(queue.offer(1u32, SHORT).is_ok());

        std::thread::scope(|scope| {
            let offering = Arc::clone(&queue);
            let handle = scope.spawn(move || offering.offer(2, Duration::from_secs(2)));

            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(queue.poll(SHORT), Some(1));

            assert!(handle.join().expect("offer thread").is_ok());
        });

        assert_eq!(queue.poll(SHORT), Some(2));
    }
}
