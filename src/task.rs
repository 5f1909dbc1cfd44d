use crate::utils::panic_message;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// A zero-argument unit of work producing a single output.
///
/// Every `FnOnce() -> O + Send` closure is a task, which is what callers
/// hand to [`Future`](crate::future::Future) and
/// [`WorkerPool`](crate::worker_pool::WorkerPool) in practice.
pub trait Task: Send {
    /// Value produced by a successful run.
    type Output: Send;
    /// Run the task to completion, consuming it.
    fn run(self) -> Self::Output;
}

impl<F, O> Task for F
where
    F: FnOnce() -> O + Send,
    O: Send,
{
    type Output = O;

    fn run(self) -> O {
        self()
    }
}

/// Why a task did not produce its output.
///
/// Carried in the result slot of the task it belongs to, so one failing task
/// never hides the results of its siblings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskError {
    /// The task panicked; holds the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Cancellation was requested before the task's output was published.
    #[error("task was cancelled")]
    Cancelled,
    /// No thread could be started to run the task.
    #[error("task could not be started: {0}")]
    NotStarted(String),
}

/// Result of a single task.
pub type TaskResult<T> = Result<T, TaskError>;

/// Run `task` behind a panic boundary.
///
/// The panic hook still fires, so the default hook prints the panic as usual.
pub(crate) fn run_isolated<T: Task>(task: T) -> TaskResult<T::Output> {
    panic::catch_unwind(AssertUnwindSafe(|| task.run()))
        .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))
}
