use crate::stream::{Receiver, Sender, bounded};
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and running work.
///
/// Cloning is cheap and every clone observes the same flag. Cancellation is
/// sticky: once [`cancel`](Self::cancel) has been called the token stays
/// cancelled. Work checks the token at well-defined points (before starting a
/// task, before transforming the next stream element) and never gets
/// interrupted halfway through a user closure.
///
/// Threads blocked on a stream can also wait on [`signal`](Self::signal) in
/// a `select!`, so cancellation wakes them.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    /// Never sent on; dropped by `cancel`, which disconnects `signal`.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Requests cancellation. Returns `true` if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        let flipped = !self.inner.cancelled.swap(true, Ordering::Release);
        if flipped {
            drop(self.inner.trigger.lock().take());
        }
        flipped
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A stream that never yields and disconnects once the token is
    /// cancelled. A `recv` on it becomes ready exactly at cancellation.
    #[must_use]
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
