use crate::{
    cancel::CancellationToken,
    config::PoolConfig,
    stream::{Receiver, Sender, bounded},
    task::{Task, TaskError, TaskResult, run_isolated},
};
use core::num::NonZeroUsize;
use log::{debug, trace, warn};
use std::{io, thread};
use thiserror::Error;

/// Error returned when a batch cannot be processed at all.
///
/// Failures of individual tasks are not errors of the batch; they are
/// reported in the task's own result slot.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerPoolError {
    /// A batch needs at least one worker.
    #[error("worker count must be at least 1")]
    NoWorkers,
    /// Not a single worker thread could be started.
    #[error("failed to spawn worker {worker}")]
    Spawn {
        /// Index of the worker that failed first.
        worker: usize,
        /// Underlying spawn error.
        source: io::Error,
    },
}

/// Run `tasks` on `worker_count` threads and collect one result per task.
///
/// Blocks until every task has run. Results come back in completion order,
/// which is unrelated to submission order; tasks that need correlation must
/// carry an identifier in their output. A panicking task yields
/// [`TaskError::Panicked`] in its slot and its worker moves on to the next
/// task.
///
/// ```
/// let tasks: [fn() -> i32; 3] = [|| 1, || 2, || 3];
/// let mut results: Vec<_> = ccp::worker_pool::process_tasks(3, tasks)
///     .unwrap()
///     .into_iter()
///     .map(Result::unwrap)
///     .collect();
/// results.sort_unstable();
/// assert_eq!(results, vec![1, 2, 3]);
/// ```
///
/// # Panics
/// In case of internal invariant violations. Impossible if there are no
/// bugs in the code.
///
/// # Errors
/// [`WorkerPoolError::NoWorkers`] if `worker_count` is zero,
/// [`WorkerPoolError::Spawn`] if no worker thread could be started.
pub fn process_tasks<I>(
    worker_count: usize,
    tasks: I,
) -> Result<Vec<TaskResult<<I::Item as Task>::Output>>, WorkerPoolError>
where
    I: IntoIterator,
    I::Item: Task,
{
    let workers = NonZeroUsize::new(worker_count).ok_or(WorkerPoolError::NoWorkers)?;
    WorkerPool::new(PoolConfig::new(workers)).process(tasks)
}

/// A fixed number of workers draining one shared task queue per batch.
///
/// Workers are scoped threads that live for the duration of one batch, so
/// tasks may borrow from the caller's stack. The pool never starts more
/// workers than the batch has tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    config: PoolConfig,
}

impl WorkerPool {
    /// A pool configured by `config`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run a batch; see [`process_tasks`].
    ///
    /// # Panics
    /// In case of internal invariant violations. Impossible if there are no
    /// bugs in the code.
    ///
    /// # Errors
    /// [`WorkerPoolError::Spawn`] if no worker thread could be started.
    pub fn process<I>(
        &self,
        tasks: I,
    ) -> Result<Vec<TaskResult<<I::Item as Task>::Output>>, WorkerPoolError>
    where
        I: IntoIterator,
        I::Item: Task,
    {
        self.run(tasks, None).map(|batch| batch.results)
    }

    /// Run a batch observing `token`.
    ///
    /// Once the token is cancelled, workers stop starting tasks and every
    /// task still queued yields [`TaskError::Cancelled`], so the batch still
    /// returns exactly one result per task. Tasks already running finish.
    ///
    /// # Panics
    /// Same as [`process`](Self::process).
    ///
    /// # Errors
    /// [`WorkerPoolError::Spawn`] if no worker thread could be started.
    pub fn process_with<I>(
        &self,
        tasks: I,
        token: &CancellationToken,
    ) -> Result<Vec<TaskResult<<I::Item as Task>::Output>>, WorkerPoolError>
    where
        I: IntoIterator,
        I::Item: Task,
    {
        self.run(tasks, Some(token)).map(|batch| batch.results)
    }

    fn run<I>(
        &self,
        tasks: I,
        token: Option<&CancellationToken>,
    ) -> Result<Batch<<I::Item as Task>::Output>, WorkerPoolError>
    where
        I: IntoIterator,
        I::Item: Task,
    {
        let tasks: Vec<_> = tasks.into_iter().collect();
        let total = tasks.len();
        if total == 0 {
            return Ok(Batch {
                results: Vec::new(),
                workers: 0,
            });
        }

        // Both queues hold the whole batch, so neither loading tasks nor
        // publishing results ever blocks.
        let (task_sender, task_queue) = bounded(total);
        for task in tasks {
            task_sender.send(task).expect("WorkerPool::run: [1]");
        }
        drop(task_sender);
        let (result_sender, result_queue) = bounded(total);

        let wanted = self.config.workers.get().min(total);
        let spawned = thread::scope(|scope| {
            let mut spawned = 0;
            let mut first_error = None;
            for index in 0..wanted {
                let mut builder =
                    thread::Builder::new().name(format!("{}-{index}", self.config.thread_name));
                if let Some(stack_size) = self.config.stack_size {
                    builder = builder.stack_size(stack_size);
                }
                let tasks = task_queue.clone();
                let results = result_sender.clone();
                let token = token.cloned();
                match builder.spawn_scoped(scope, move || work(index, &tasks, &results, token)) {
                    Ok(_) => spawned += 1,
                    Err(source) => {
                        warn!("failed to spawn worker {index}: {source}");
                        if first_error.is_none() {
                            first_error = Some(WorkerPoolError::Spawn {
                                worker: index,
                                source,
                            });
                        }
                    }
                }
            }
            match first_error {
                Some(err) if spawned == 0 => Err(err),
                _ => Ok(spawned),
            }
        })?;
        debug!("processed {total} task(s) on {spawned} worker(s)");

        let results: Vec<_> = result_queue.try_iter().collect();
        assert_eq!(results.len(), total, "WorkerPool::run: [2]");
        Ok(Batch {
            results,
            workers: spawned,
        })
    }
}

/// Outcome of one batch.
struct Batch<O> {
    results: Vec<TaskResult<O>>,
    /// Worker threads actually started.
    workers: usize,
}

/// Worker loop: take the next task until the queue is empty.
fn work<T: Task>(
    index: usize,
    tasks: &Receiver<T>,
    results: &Sender<TaskResult<T::Output>>,
    token: Option<CancellationToken>,
) {
    trace!("worker {index} starting");
    let mut executed = 0usize;
    for task in tasks {
        let result = if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            drop(task);
            Err(TaskError::Cancelled)
        } else {
            executed += 1;
            run_isolated(task)
        };
        if let Err(TaskError::Panicked(message)) = &result {
            warn!("worker {index}: task panicked: {message}");
        }
        results.send(result).expect("WorkerPool::work: [1]");
    }
    trace!("worker {index} exiting after {executed} task(s)");
}
