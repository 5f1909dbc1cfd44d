use crate::{
    cancel::CancellationToken,
    config::PipelineConfig,
    pipeline::{PipelineError, PipelineItem, Transform},
    stream::{Receiver, Sender, bounded},
    task::run_isolated,
};
use crossbeam::{channel::never, select};
use log::{debug, trace, warn};
use std::thread;

/// One running stage: reads `input`, lifts each element into a
/// [`PipelineItem`], applies `transform` to values and writes the result.
pub(super) struct StageSpec<T> {
    pub(super) index: usize,
    /// `None` makes the stage a plain relay.
    pub(super) transform: Option<Transform<T>>,
    pub(super) token: Option<CancellationToken>,
}

/// Spawn a stage thread and return its output stream.
///
/// The output stream closes when the input is exhausted, right after the
/// first error item, or when the consumer goes away. A stage blocked on its
/// input or its output wakes up on cancellation, emits
/// [`PipelineError::Cancelled`] and closes. If the thread cannot be
/// spawned, the returned stream carries a single [`PipelineError::Spawn`]
/// item.
pub(super) fn spawn_stage<I, T, L>(
    spec: StageSpec<T>,
    input: Receiver<I>,
    lift: L,
    config: &PipelineConfig,
) -> Receiver<PipelineItem<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    L: Fn(I) -> PipelineItem<T> + Send + 'static,
{
    let index = spec.index;
    let (sender, receiver) = bounded(config.channel_capacity);
    let body = move || {
        let StageSpec {
            index,
            transform,
            token,
        } = spec;
        let cancelled = token.as_ref().map_or_else(never, |token| token.signal().clone());
        trace!("pipeline stage {index} starting");
        loop {
            let element = select! {
                recv(input) -> element => match element {
                    Ok(element) => element,
                    Err(_) => break,
                },
                recv(cancelled) -> _ => {
                    emit_cancelled(index, &sender);
                    break;
                }
            };
            let item = match lift(element) {
                Ok(_) if token.as_ref().is_some_and(CancellationToken::is_cancelled) => {
                    Err(PipelineError::Cancelled)
                }
                Ok(value) => match &transform {
                    Some(transform) => run_isolated(|| transform(value))
                        .map_err(|source| PipelineError::StageFault { stage: index, source }),
                    None => Ok(value),
                },
                Err(err) => Err(err),
            };
            if let Err(PipelineError::StageFault { source, .. }) = &item {
                warn!("pipeline stage {index} faulted: {source}");
            }
            let terminal = item.is_err();
            select! {
                send(sender, item) -> sent => if sent.is_err() {
                    debug!("pipeline stage {index}: downstream closed");
                    break;
                },
                recv(cancelled) -> _ => {
                    emit_cancelled(index, &sender);
                    break;
                }
            }
            if terminal {
                break;
            }
        }
        trace!("pipeline stage {index} exiting");
    };
    let spawned = thread::Builder::new()
        .name(format!("{}-{index}", config.thread_name))
        .spawn(body);
    match spawned {
        Ok(_) => receiver,
        Err(err) => {
            warn!("failed to spawn pipeline stage {index}: {err}");
            let (sender, receiver) = bounded(1);
            sender
                .send(Err(PipelineError::Spawn {
                    stage: index,
                    message: err.to_string(),
                }))
                .expect("spawn_stage: [1]");
            receiver
        }
    }
}

/// Hand the cancellation marker downstream. Blocks until the next stage or
/// the consumer takes it, or fails right away once they are gone.
fn emit_cancelled<T>(index: usize, output: &Sender<PipelineItem<T>>) {
    debug!("pipeline stage {index} cancelled");
    if output.send(Err(PipelineError::Cancelled)).is_err() {
        debug!("pipeline stage {index}: downstream closed");
    }
}
