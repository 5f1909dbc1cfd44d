use core::num::NonZeroUsize;
use log::warn;
use serde::Deserialize;

/// Environment variable overriding the default worker count.
pub const WORKERS_ENV: &str = "CCP_WORKERS";

/// Settings of a [`WorkerPool`](crate::worker_pool::WorkerPool).
///
/// Deserializable so it can live in an application's config file; missing
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: NonZeroUsize,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name: String,
    /// Stack size of worker threads, platform default if unset.
    pub stack_size: Option<usize>,
}

impl PoolConfig {
    /// A config with exactly `workers` workers and default naming.
    #[must_use]
    pub fn new(workers: NonZeroUsize) -> Self {
        Self {
            workers,
            thread_name: default_worker_name(),
            stack_size: None,
        }
    }

    /// Replaces the thread name prefix.
    #[must_use]
    pub fn with_thread_name(self, thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            ..self
        }
    }

    /// Sets the worker stack size in bytes.
    #[must_use]
    pub fn with_stack_size(self, stack_size: usize) -> Self {
        Self {
            stack_size: Some(stack_size),
            ..self
        }
    }
}

impl Default for PoolConfig {
    /// Worker count comes from `CCP_WORKERS` if it holds a positive integer,
    /// otherwise from the number of logical CPUs.
    fn default() -> Self {
        Self::new(default_workers())
    }
}

/// Settings of a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the stream between two consecutive stages.
    ///
    /// `0` makes every hand-off a rendezvous, so a stage can run at most one
    /// element ahead of its consumer.
    pub channel_capacity: usize,
    /// Prefix of stage thread names; the stage index is appended.
    pub thread_name: String,
}

impl PipelineConfig {
    /// Replaces the inter-stage channel capacity.
    #[must_use]
    pub fn with_channel_capacity(self, channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            ..self
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 0,
            thread_name: String::from("ccp-stage"),
        }
    }
}

fn default_worker_name() -> String {
    String::from("ccp-worker")
}

fn default_workers() -> NonZeroUsize {
    let cpus = || NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN);
    match std::env::var(WORKERS_ENV) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|err| {
            warn!("ignoring {WORKERS_ENV}={raw:?}: {err}");
            cpus()
        }),
        Err(_) => cpus(),
    }
}
