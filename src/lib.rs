//! Reusable concurrency patterns built on threads and channels.
//!
//! The crate provides five independent primitives that compose through
//! [`stream::Receiver`] values:
//! - [`future::Future`]: a single computation on its own thread whose result
//!   cell resolves exactly once and can be read any number of times.
//! - [`fan_in::FanIn`]: merges many input streams into one merged stream that
//!   closes once every input is exhausted, and can be closed explicitly.
//! - [`pipeline::Pipeline`]: an ordered chain of element-wise transforms, one
//!   thread per stage, with backpressure through bounded streams.
//! - [`worker_pool::WorkerPool`]: runs a finite batch of tasks on a fixed
//!   number of workers and returns one result per task.
//! - [`key_registry::KeyRegistry`]: a thread-safe set of exclusively held
//!   4-byte keys with non-blocking acquisition.
//!
//! Panics inside user code are contained: a panicking computation resolves
//! its future, pipeline stage or batch slot to a [`task::TaskError`] instead
//! of tearing down the process or leaving readers blocked. Long-running
//! operations accept a [`cancel::CancellationToken`].
//!
//! With the `loom` feature the lock-based primitives (the future result cell
//! and the key registry) are built on `loom` and can be model checked; see
//! `tests/loom.rs`.

/// Cooperative cancellation shared between a requester and running work.
pub mod cancel;
/// Configuration of worker pools and pipelines.
///
/// Both configs deserialize with `serde`, with every field optional. The
/// default worker count honours the `CCP_WORKERS` environment variable.
pub mod config;
/// Merging of many streams into one.
pub mod fan_in;
/// One-shot computations with a blocking, repeatable read.
pub mod future;
/// Exclusive ownership of fixed-size keys.
pub mod key_registry;
/// Multi-stage stream transforms.
pub mod pipeline;
pub mod stream;
mod sync;
/// The unit of work run by futures and worker pools, and its failure modes.
pub mod task;
/// Core value types shared across the crate.
pub mod types;
mod utils;
/// Batch execution on a fixed number of worker threads.
pub mod worker_pool;
