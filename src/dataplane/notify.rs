//! Wake-up primitive between pipeline stages
//!
//! A stage that produced work (or freed capacity) tells the peer through a
//! [`Notify`]. Whether the peer actually wants to be told is tracked by the
//! request/cancel flags on the ring endpoints (see [`super::ring`]).

use std::sync::atomic::{AtomicUsize, Ordering};

/// "Work available" signal delivered to another stage
pub trait Notify: Send + Sync {
    fn notify(&self);
}

impl Notify for tokio::sync::Notify {
    fn notify(&self) {
        self.notify_one();
    }
}

/// Notification delivered through a callback
pub struct FnNotify<F>(pub F);

impl<F: Fn() + Send + Sync> Notify for FnNotify<F> {
    fn notify(&self) {
        (self.0)()
    }
}

/// Discards notifications (stages driven by polling)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotify;

impl Notify for NoopNotify {
    fn notify(&self) {}
}

/// Counts notifications; the instance uses it to know whether another
/// processing pass is needed.
#[derive(Debug, Default)]
pub struct CountingNotify(AtomicUsize);

impl CountingNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications since the last call
    pub fn take(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }
}

impl Notify for CountingNotify {
    fn notify(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fn_notify() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let notify = FnNotify(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        notify.notify();
        notify.notify();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_counting_notify_take_resets() {
        let notify = CountingNotify::new();
        notify.notify();
        notify.notify();
        assert_eq!(notify.take(), 2);
        assert_eq!(notify.take(), 0);
    }

    #[tokio::test]
    async fn test_tokio_notify_wakes_waiter() {
        let notify = Arc::new(tokio::sync::Notify::new());
        let waiter = notify.clone();
        let handle = tokio::spawn(async move { waiter.notified().await });

        Notify::notify(notify.as_ref());
        handle.await.unwrap();
    }
}
