mod stage;

use crate::{
    cancel::CancellationToken,
    config::PipelineConfig,
    pipeline::stage::{StageSpec, spawn_stage},
    stream::Receiver,
    task::TaskError,
};
use derive_more::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Element-wise transform applied by one stage.
pub type Transform<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Element of a pipeline's output stream.
///
/// An `Err` item is always the last item of the stream.
pub type PipelineItem<T> = Result<T, PipelineError>;

/// Terminal error marker carried through a pipeline's streams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineError {
    /// A stage's transform panicked. Stages are numbered from 0 in the order
    /// they were added.
    #[error("pipeline stage {stage} faulted")]
    StageFault {
        /// Index of the faulting stage.
        stage: usize,
        /// What went wrong inside the transform.
        source: TaskError,
    },
    /// Cancellation was requested while elements were still flowing.
    #[error("pipeline was cancelled")]
    Cancelled,
    /// A stage thread could not be started.
    #[error("pipeline stage {stage} could not be started: {message}")]
    Spawn {
        /// Index of the stage.
        stage: usize,
        /// The spawn error, rendered.
        message: String,
    },
}

/// Builder for a chain of element-wise transforms.
///
/// Stages run in the order they were added, each on its own thread, linked
/// by bounded streams. For an input `[x1, ..., xn]` and stages
/// `[f1, ..., fk]` the output is `[fk(...f1(x1)), ..., fk(...f1(xn))]` in
/// that order: no stage reorders, drops or duplicates elements. A slow
/// consumer blocks the last stage, which blocks its predecessor, and so on
/// up to the producer.
///
/// When a transform panics, the stage emits one
/// [`PipelineError::StageFault`] item and closes its output; downstream
/// stages forward that marker and close too, so the consumer always sees the
/// fault followed by the end of the stream.
///
/// ```
/// use ccp::{pipeline::Pipeline, stream};
///
/// let composed = Pipeline::new().stage(|x: i32| x + 1).stage(|x| x * 10).build();
/// let output: Vec<_> = composed.run(stream::from_iter([1, 2, 3])).iter().collect();
/// assert_eq!(output, vec![Ok(20), Ok(30), Ok(40)]);
/// ```
#[derive(Debug)]
pub struct Pipeline<T> {
    #[debug(skip)]
    stages: Vec<Transform<T>>,
    config: PipelineConfig,
}

impl<T: Send + 'static> Pipeline<T> {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    /// An empty pipeline; alias of [`new`](Self::new).
    #[must_use]
    pub fn builder() -> Self {
        Self::new()
    }

    /// An empty pipeline using `config` for its stages.
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            config,
        }
    }

    /// Append a stage.
    pub fn add_stage<F>(&mut self, transform: F) -> &mut Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.stages.push(Arc::new(transform));
        self
    }

    /// Append a stage, builder style.
    #[must_use]
    pub fn stage<F>(mut self, transform: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.add_stage(transform);
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Freeze the current stages into a reusable composed pipeline.
    ///
    /// Stages added afterwards do not affect the returned value.
    #[must_use]
    pub fn build(&self) -> ComposedPipeline<T> {
        ComposedPipeline {
            stages: self.stages.iter().cloned().collect(),
            config: self.config.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A built pipeline: a function from an input stream to an output stream.
///
/// Every [`run`](Self::run) starts a fresh set of stage threads, so one
/// composed pipeline can process several streams, also concurrently.
#[derive(Debug)]
pub struct ComposedPipeline<T> {
    #[debug(skip)]
    stages: Arc<[Transform<T>]>,
    config: PipelineConfig,
}

impl<T> Clone for ComposedPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
            config: self.config.clone(),
        }
    }
}

impl<T: Send + 'static> ComposedPipeline<T> {
    /// Wire the stages onto `input` and return the last stage's output.
    ///
    /// A pipeline without stages relays every element unchanged.
    pub fn run(&self, input: Receiver<T>) -> Receiver<PipelineItem<T>> {
        self.spawn(input, None)
    }

    /// Like [`run`](Self::run), observing `token`.
    ///
    /// Stages check the token before transforming each element and also wake
    /// up on cancellation while waiting on an idle producer or a stalled
    /// consumer. Once it is cancelled the output carries
    /// [`PipelineError::Cancelled`] and closes.
    pub fn run_with(
        &self,
        input: Receiver<T>,
        token: &CancellationToken,
    ) -> Receiver<PipelineItem<T>> {
        self.spawn(input, Some(token))
    }

    fn spawn(
        &self,
        input: Receiver<T>,
        token: Option<&CancellationToken>,
    ) -> Receiver<PipelineItem<T>> {
        let mut stages = self.stages.iter().cloned().enumerate();
        let spec = |(index, transform): (usize, Option<Transform<T>>)| StageSpec {
            index,
            transform,
            token: token.cloned(),
        };
        // The first stage lifts raw elements into items; later ones pass
        // items through.
        let first = stages
            .next()
            .map_or((0, None), |(index, transform)| (index, Some(transform)));
        let mut output = spawn_stage(spec(first), input, Ok, &self.config);
        for (index, transform) in stages {
            output = spawn_stage(
                spec((index, Some(transform))),
                output,
                |item| item,
                &self.config,
            );
        }
        output
    }
}

/// Apply `pipeline` to `input`; equivalent to `pipeline.run(input)`.
pub fn execute<T: Send + 'static>(
    input: Receiver<T>,
    pipeline: &ComposedPipeline<T>,
) -> Receiver<PipelineItem<T>> {
    pipeline.run(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{self, bounded};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[test_log::test]
    fn stages_compose_in_order() {
        let composed = Pipeline::new()
            .stage(|x: i64| x + 1)
            .stage(|x| x * 2)
            .stage(|x| x - 3)
            .build();
        let output: Vec<_> = composed.run(stream::from_iter(1..=5)).iter().collect();
        let expected: Vec<PipelineItem<i64>> = (1..=5).map(|x| Ok((x + 1) * 2 - 3)).collect();
        assert_eq!(output, expected);
    }

    #[test_log::test]
    fn order_is_preserved_for_long_streams() {
        let composed = Pipeline::with_config(PipelineConfig::default().with_channel_capacity(4))
            .stage(|x: u32| x.wrapping_mul(31))
            .stage(|x| x ^ 0x5a5a)
            .build();
        let input: Vec<u32> = (0..1_000).collect();
        let output: Vec<_> = execute(stream::from_iter(input.clone()), &composed)
            .iter()
            .map(Result::unwrap)
            .collect();
        let expected: Vec<_> = input.iter().map(|x| x.wrapping_mul(31) ^ 0x5a5a).collect();
        assert_eq!(output, expected);
    }

    #[test_log::test]
    fn each_transform_runs_once_per_element() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let composed = Pipeline::new()
            .stage(|x: u8| {
                CALLS.fetch_add(1, Ordering::Relaxed);
                x
            })
            .build();
        assert_eq!(composed.run(stream::from_iter(0..10)).iter().count(), 10);
        assert_eq!(CALLS.load(Ordering::Relaxed), 10);
    }

    #[test_log::test]
    fn empty_pipeline_relays_elements() {
        let composed = Pipeline::<&str>::builder().build();
        let output: Vec<_> = composed.run(stream::from_iter(["a", "b"])).iter().collect();
        assert_eq!(output, vec![Ok("a"), Ok("b")]);
    }

    #[test_log::test]
    fn output_closes_when_input_closes() {
        let composed = Pipeline::new().stage(|x: i32| x).build();
        let (sender, receiver) = bounded(0);
        let output = composed.run(receiver);
        let producer = thread::spawn(move || {
            sender.send(1).unwrap();
            sender.send(2).unwrap();
        });
        assert_eq!(output.recv(), Ok(Ok(1)));
        assert_eq!(output.recv(), Ok(Ok(2)));
        producer.join().unwrap();
        assert!(output.recv().is_err());
    }

    #[test_log::test]
    fn stage_fault_is_reported_then_the_stream_closes() {
        let composed = Pipeline::new()
            .stage(|x: i32| x + 1)
            .stage(|x| {
                assert!(x != 3, "cannot handle {x}");
                x
            })
            .stage(|x| x * 100)
            .build();
        let output: Vec<_> = composed.run(stream::from_iter(1..=5)).iter().collect();
        assert_eq!(output.len(), 2);
        assert_eq!(output[0], Ok(200));
        match &output[1] {
            Err(PipelineError::StageFault {
                stage: 1,
                source: TaskError::Panicked(message),
            }) => assert_eq!(message, "cannot handle 3"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test_log::test]
    fn cancellation_closes_the_stream_with_a_marker() {
        let token = CancellationToken::new();
        let composed = Pipeline::new().stage(|x: u32| x).stage(|x| x).build();
        let (sender, receiver) = bounded(0);
        let output = composed.run_with(receiver, &token);
        sender.send(1).unwrap();
        assert_eq!(output.recv(), Ok(Ok(1)));
        token.cancel();
        assert_eq!(output.recv(), Ok(Err(PipelineError::Cancelled)));
        assert!(output.recv().is_err());
        // The first stage takes at most one more element before it exits.
        let mut accepted = 0;
        while sender.send(2).is_ok() {
            accepted += 1;
        }
        assert!(accepted <= 1);
    }

    #[test_log::test]
    fn cancellation_wakes_stages_waiting_on_an_idle_input() {
        let token = CancellationToken::new();
        let composed = Pipeline::new().stage(|x: u32| x + 1).stage(|x| x * 2).build();
        let (sender, receiver) = bounded::<u32>(0);
        let output = composed.run_with(receiver, &token);
        token.cancel();
        assert_eq!(
            output.recv_timeout(Duration::from_secs(5)),
            Ok(Err(PipelineError::Cancelled))
        );
        assert!(output.recv_timeout(Duration::from_secs(5)).is_err());
        drop(sender);
    }

    #[test_log::test]
    fn cancellation_wakes_stages_waiting_on_a_stalled_consumer() {
        let token = CancellationToken::new();
        let composed = Pipeline::new().stage(|x: u32| x).stage(|x| x).build();
        let output = composed.run_with(stream::from_iter([1, 2, 3]), &token);
        // Both stages now block handing elements on.
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let items: Vec<_> = output.iter().collect();
        assert!(
            matches!(
                items.as_slice(),
                [Err(PipelineError::Cancelled)] | [Ok(1), Err(PipelineError::Cancelled)]
            ),
            "unexpected items: {items:?}"
        );
    }

    #[test_log::test]
    fn composed_pipeline_is_reusable() {
        let composed = Pipeline::new().stage(|x: i32| -x).build();
        let again = composed.clone();
        let a = composed.run(stream::from_iter([1, 2]));
        let b = again.run(stream::from_iter([3]));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![Ok(-1), Ok(-2)]);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![Ok(-3)]);
    }

    #[test_log::test]
    fn dropping_the_output_stops_the_stages() {
        let composed = Pipeline::new().stage(|x: u32| x).build();
        let (sender, receiver) = bounded(0);
        let output = composed.run(receiver);
        sender.send(1).unwrap();
        drop(output);
        // The stage fails to hand over `1`, exits and drops its input.
        assert!(sender.send(2).is_err());
    }
}
