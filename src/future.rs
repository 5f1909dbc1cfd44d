use crate::{
    cancel::CancellationToken,
    sync::{self, Arc, Condvar, Mutex, MutexGuard},
    task::{Task, TaskError, TaskResult, run_isolated},
};
use core::{fmt, mem, time::Duration};
use log::{debug, warn};
use std::{io, time::Instant};
use thiserror::Error;

/// Error returned when reading or submitting a [`Future`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FutureError {
    /// `get` was called on a future that has never been submitted, so no
    /// producer exists that could ever resolve it.
    #[error("future was never submitted")]
    NotSubmitted,
    /// `submit` was called on a future that already left the unsubmitted
    /// state.
    #[error("future was already submitted or resolved")]
    AlreadySubmitted,
    /// A bounded wait expired before the future resolved.
    #[error("future did not resolve in time")]
    Timeout,
    /// The value was moved out by [`Future::wait`].
    #[error("future value was already taken")]
    Taken,
    /// The computation failed or was cancelled.
    #[error(transparent)]
    Failed(#[from] TaskError),
    /// No thread could be started for the computation.
    #[error("failed to spawn future thread")]
    Spawn(#[source] io::Error),
}

type Job<T> = Box<dyn FnOnce() -> TaskResult<T> + Send>;

enum Slot<T> {
    Unsubmitted(Job<T>),
    Pending,
    Ready(T),
    Failed(TaskError),
    Taken,
}

impl<T> Slot<T> {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed(_) | Self::Taken)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Unsubmitted(_) => "unsubmitted",
            Self::Pending => "pending",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
            Self::Taken => "taken",
        }
    }

    /// Outcome of a read that stopped waiting in this state.
    fn read(&self) -> Result<&T, FutureError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Failed(err) => Err(FutureError::Failed(err.clone())),
            Self::Taken => Err(FutureError::Taken),
            Self::Unsubmitted(_) => Err(FutureError::NotSubmitted),
            Self::Pending => Err(FutureError::Timeout),
        }
    }
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
}

impl<T> Shared<T> {
    /// Move a pending slot to its terminal state. Only the first publication
    /// wins; later ones are dropped and reported as `false`.
    fn publish(&self, outcome: TaskResult<T>) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Pending | Slot::Unsubmitted(_) => {}
            _ => return false,
        }
        *slot = match outcome {
            Ok(value) => Slot::Ready(value),
            Err(err) => Slot::Failed(err),
        };
        drop(slot);
        self.resolved.notify_all();
        true
    }

    /// Block while the slot is pending, at most `timeout` if one is given.
    /// A timeout too large to be represented as a deadline waits unbounded.
    fn wait(&self, timeout: Option<Duration>) -> MutexGuard<'_, Slot<T>> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut slot = self.slot.lock();
        while let Slot::Pending = *slot {
            let Some(deadline) = deadline else {
                slot = self.resolved.wait(slot);
                continue;
            };
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let (guard, timed_out) = self.resolved.wait_for(slot, left);
            slot = guard;
            if timed_out {
                break;
            }
        }
        slot
    }
}

/// Handle to a single computation running on its own thread.
///
/// A future is created unsubmitted. [`submit`](Self::submit) starts the
/// computation exactly once; afterwards the result cell moves from pending to
/// exactly one terminal state (value, failure or cancellation) and keeps it.
/// Any number of readers may observe that terminal state, so reading twice
/// never blocks forever.
///
/// A computation that panics resolves the future to
/// [`TaskError::Panicked`] instead of leaving readers waiting.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Future<T> {
    /// Wrap `compute` in an unsubmitted future. Nothing runs yet.
    pub fn new<F>(compute: F) -> Self
    where
        F: Task<Output = T> + 'static,
    {
        let job: Job<T> = Box::new(move || run_isolated(compute));
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Unsubmitted(job)),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Start the computation on a new thread.
    ///
    /// # Errors
    /// [`FutureError::AlreadySubmitted`] if the future was submitted or
    /// resolved before, [`FutureError::Spawn`] if the thread could not be
    /// started. In the latter case the future resolves to
    /// [`TaskError::NotStarted`].
    pub fn submit(&self) -> Result<(), FutureError> {
        self.start(None)
    }

    /// Like [`submit`](Self::submit), observing `token`.
    ///
    /// If the token is cancelled before the computation starts, it never
    /// runs; if it is cancelled while the computation runs, the value is
    /// discarded. Either way the future resolves to [`TaskError::Cancelled`].
    ///
    /// # Errors
    /// Same as [`submit`](Self::submit).
    pub fn submit_with(&self, token: &CancellationToken) -> Result<(), FutureError> {
        self.start(Some(token.clone()))
    }

    fn start(&self, token: Option<CancellationToken>) -> Result<(), FutureError> {
        let job = {
            let mut slot = self.shared.slot.lock();
            match mem::replace(&mut *slot, Slot::Pending) {
                Slot::Unsubmitted(job) => job,
                other => {
                    *slot = other;
                    return Err(FutureError::AlreadySubmitted);
                }
            }
        };
        let shared = Arc::clone(&self.shared);
        let body = move || {
            let cancelled = || token.as_ref().is_some_and(CancellationToken::is_cancelled);
            let outcome = if cancelled() {
                Err(TaskError::Cancelled)
            } else {
                match job() {
                    Ok(_) if cancelled() => Err(TaskError::Cancelled),
                    outcome => outcome,
                }
            };
            if let Err(TaskError::Panicked(message)) = &outcome {
                warn!("future computation panicked: {message}");
            }
            if !shared.publish(outcome) {
                debug!("future was cancelled before its computation finished");
            }
        };
        sync::spawn(String::from("ccp-future"), body).map_err(|err| {
            self.shared.publish(Err(TaskError::NotStarted(err.to_string())));
            FutureError::Spawn(err)
        })
    }

    /// Block until the future resolves and return a copy of its value.
    ///
    /// Every call returns the same outcome.
    ///
    /// # Errors
    /// [`FutureError::Failed`] if the computation panicked or was cancelled,
    /// [`FutureError::NotSubmitted`] if the future was never submitted,
    /// [`FutureError::Taken`] after [`wait`](Self::wait) moved the value out.
    pub fn get(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.shared.wait(None).read().cloned()
    }

    /// Like [`get`](Self::get) but waits at most `timeout`.
    ///
    /// # Errors
    /// [`FutureError::Timeout`] if the future is still pending when the
    /// timeout expires, otherwise the same as [`get`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.shared.wait(Some(timeout)).read().cloned()
    }

    /// The outcome if the future has resolved, `None` while it is pending.
    pub fn try_get(&self) -> Option<Result<T, FutureError>>
    where
        T: Clone,
    {
        let slot = self.shared.slot.lock();
        match *slot {
            Slot::Pending => None,
            ref slot => Some(slot.read().cloned()),
        }
    }

    /// Block until the future resolves and move its value out.
    ///
    /// # Errors
    /// Same as [`get`](Self::get).
    pub fn wait(self) -> Result<T, FutureError> {
        let mut slot = self.shared.wait(None);
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Ok(value),
            other => {
                let err = other.read().err();
                *slot = other;
                Err(err.unwrap_or(FutureError::Taken))
            }
        }
    }

    /// Resolve the future to [`TaskError::Cancelled`] unless it already
    /// resolved.
    ///
    /// Readers blocked in [`get`](Self::get) wake up immediately. A
    /// computation that is already running is not interrupted; its result is
    /// discarded. Returns whether this call resolved the future.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.publish(Err(TaskError::Cancelled));
        if cancelled {
            debug!("future cancelled");
        }
        cancelled
    }

    /// Whether the future reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().is_terminal()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.shared.slot.lock().name())
            .finish()
    }
}
