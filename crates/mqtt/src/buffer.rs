//! Bounded containers used by the ingestion pipeline.
//!
//! [`BoundedHistory`] is a plain FIFO ring kept under the pipeline's data
//! lock. [`IncomingQueue`] is the hand-off between the protocol callback and
//! the worker task; it carries its own short-lived lock so producers never
//! wait on the data lock.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Fixed-capacity ordered history. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Appends an item and returns whatever fell off the front.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> BoundedHistory<T> {
    /// Copies out the newest `count` items (all of them for `None`),
    /// oldest first.
    pub fn snapshot(&self, count: Option<usize>) -> Vec<T> {
        let take = count.unwrap_or(self.items.len()).min(self.items.len());
        self.items
            .iter()
            .skip(self.items.len() - take)
            .cloned()
            .collect()
    }
}

/// Bounded multi-producer, single-consumer work queue.
///
/// `try_push` never blocks. The consumer waits on [`IncomingQueue::pop_timeout`]
/// with a bounded wait so it can notice shutdown between items.
#[derive(Debug)]
pub struct IncomingQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> IncomingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues an item, handing it back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drops the oldest queued item to make room.
    pub fn evict_oldest(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pops the next item, waiting at most `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }

        // notify_one stores a permit when nobody is waiting, so a push that
        // lands between try_pop and here still wakes us
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_newest() {
        let mut history = BoundedHistory::new(3);
        for i in 0..5 {
            history.push(i);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.snapshot(None), vec![2, 3, 4]);
    }

    #[test]
    fn test_history_push_returns_evicted() {
        let mut history = BoundedHistory::new(2);
        assert_eq!(history.push("a"), None);
        assert_eq!(history.push("b"), None);
        assert_eq!(history.push("c"), Some("a"));
    }

    #[test]
    fn test_history_snapshot_count() {
        let mut history = BoundedHistory::new(10);
        for i in 0..5 {
            history.push(i);
        }
        assert_eq!(history.snapshot(Some(2)), vec![3, 4]);
        assert_eq!(history.snapshot(Some(50)), vec![0, 1, 2, 3, 4]);
        assert!(history.snapshot(Some(0)).is_empty());
    }

    #[test]
    fn test_history_zero_capacity() {
        let mut history = BoundedHistory::new(0);
        assert_eq!(history.push(1), Some(1));
        assert!(history.is_empty());
    }

    #[test]
    fn test_queue_rejects_when_full() {
        let queue = IncomingQueue::new(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3));

        assert_eq!(queue.evict_oldest(), Some(1));
        assert!(queue.try_push(3).is_ok());
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_pop_timeout_empty() {
        let queue: IncomingQueue<u32> = IncomingQueue::new(4);
        assert_eq!(queue.pop_timeout(Duration::from_millis(500)).await, None);
    }

    #[tokio::test]
    async fn test_queue_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(IncomingQueue::new(4));
        let producer = queue.clone();

        let consumer =
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        producer.try_push(9).unwrap();

        assert_eq!(consumer.await.unwrap(), Some(9));
    }
}
