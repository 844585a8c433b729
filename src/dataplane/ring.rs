//! Fixed-capacity single-producer/single-consumer ring queues
//!
//! Every pipeline stage exchanges data with its neighbours only through
//! these rings. The two halves are not `Clone`, so each ring has exactly one
//! producer and one consumer.
//!
//! Each side can ask to be notified by the other: the consumer when it runs
//! dry and wants to hear about new items, the producer when the ring is full
//! and it wants to hear about free space. The peer checks the flag after
//! doing its work and fires the [`Notify`] only if it was requested.

use super::notify::Notify;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared<T> {
    queue: ArrayQueue<T>,
    consumer_waiting: AtomicBool,
    producer_waiting: AtomicBool,
}

/// Producing half of a ring
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half of a ring
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

/// Create a ring holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        consumer_waiting: AtomicBool::new(false),
        producer_waiting: AtomicBool::new(false),
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

impl<T> Producer<T> {
    /// Enqueue an item, handing it back if the ring is full
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.shared.queue.push(item)
    }

    pub fn is_full(&self) -> bool {
        self.shared.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Ask the consumer to notify us once it frees space
    pub fn request_notification(&self) {
        self.shared.producer_waiting.store(true, Ordering::Release);
    }

    pub fn cancel_notification(&self) {
        self.shared.producer_waiting.store(false, Ordering::Release);
    }

    /// Whether the consumer asked to hear about new items
    pub fn consumer_waiting(&self) -> bool {
        self.shared.consumer_waiting.load(Ordering::Acquire)
    }

    /// Notify the consumer if it asked for it. Returns whether a
    /// notification was sent.
    pub fn notify_consumer(&self, target: &dyn Notify) -> bool {
        if !self.is_empty() && self.shared.consumer_waiting.swap(false, Ordering::AcqRel) {
            target.notify();
            return true;
        }
        false
    }
}

impl<T> Consumer<T> {
    pub fn dequeue(&self) -> Option<T> {
        self.shared.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Ask the producer to notify us once it enqueues something
    pub fn request_notification(&self) {
        self.shared.consumer_waiting.store(true, Ordering::Release);
    }

    pub fn cancel_notification(&self) {
        self.shared.consumer_waiting.store(false, Ordering::Release);
    }

    /// Whether the producer is stalled waiting for space
    pub fn producer_waiting(&self) -> bool {
        self.shared.producer_waiting.load(Ordering::Acquire)
    }

    /// Notify the producer if it asked for it and there is now space.
    pub fn notify_producer(&self, target: &dyn Notify) -> bool {
        if !self.shared.queue.is_full()
            && self.shared.producer_waiting.swap(false, Ordering::AcqRel)
        {
            target.notify();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::notify::CountingNotify;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = channel(4);
        for i in 0..3 {
            tx.enqueue(i).unwrap();
        }
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.dequeue(), Some(0));
        assert_eq!(rx.dequeue(), Some(1));
        assert_eq!(rx.dequeue(), Some(2));
        assert_eq!(rx.dequeue(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_returns_item() {
        let (tx, rx) = channel(2);
        tx.enqueue("a").unwrap();
        tx.enqueue("b").unwrap();
        assert!(tx.is_full());
        assert_eq!(tx.enqueue("c"), Err("c"));

        rx.dequeue();
        assert!(!tx.is_full());
        tx.enqueue("c").unwrap();
    }

    #[test]
    fn test_consumer_notification_only_when_requested() {
        let (tx, rx) = channel(4);
        let notify = CountingNotify::new();

        tx.enqueue(1).unwrap();
        assert!(!tx.notify_consumer(&notify));

        rx.request_notification();
        assert!(tx.consumer_waiting());
        assert!(tx.notify_consumer(&notify));
        // One-shot: the flag is consumed
        assert!(!tx.notify_consumer(&notify));
        assert_eq!(notify.take(), 1);

        rx.request_notification();
        rx.cancel_notification();
        assert!(!tx.notify_consumer(&notify));
    }

    #[test]
    fn test_producer_notification_on_space() {
        let (tx, rx) = channel(1);
        let notify = CountingNotify::new();

        tx.enqueue(1).unwrap();
        tx.request_notification();
        assert!(rx.producer_waiting());

        // Still full: nothing to report
        assert!(!rx.notify_producer(&notify));

        rx.dequeue();
        assert!(rx.notify_producer(&notify));
        assert!(!rx.producer_waiting());
        assert_eq!(notify.take(), 1);
    }
}
