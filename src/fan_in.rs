use crate::stream::{Receiver, Sender, bounded};
use core::mem;
use crossbeam::select;
use derive_more::Debug;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{
    io,
    thread::{self, JoinHandle},
};
use thiserror::Error;

const FORWARDER_NAME: &str = "ccp-fan-in";

/// Error returned when a [`FanIn`] cannot start merging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FanInError {
    /// The forwarding thread for one input could not be started. Forwarders
    /// spawned before it were shut down again.
    #[error("failed to spawn the forwarder of input {input}")]
    Spawn {
        /// Registration index of the input.
        input: usize,
        /// Underlying spawn error.
        source: io::Error,
    },
}

/// Observable lifecycle of a [`FanIn`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FanInState {
    /// Never started.
    Idle,
    /// Forwarders are running for the current arming.
    Running,
    /// Closed; the next start re-arms with a fresh merged stream.
    Stopped,
}

/// Merges many input streams into one output stream.
///
/// Each registered input gets a forwarding thread that moves its elements to
/// the merged stream. The merged stream closes once every input of the
/// current arming has been drained and closed by its producer. An input that
/// is never closed keeps the merged stream open.
///
/// Elements of one input keep their relative order; elements of different
/// inputs interleave in whatever order they become ready.
///
/// The fan-in does not own its inputs: it holds clones of the receivers, and
/// callers keep theirs.
///
/// [`close`](Self::close) tears the current arming down: it signals every
/// forwarder to stop, waits for all of them to exit and then allows a later
/// [`start`](Self::start) to merge the registered inputs again into a new
/// merged stream. Dropping a running fan-in closes it.
#[derive(Debug)]
pub struct FanIn<T> {
    #[debug(skip)]
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

struct Inner<T> {
    inputs: Vec<Receiver<T>>,
    lifecycle: Lifecycle<T>,
}

enum Lifecycle<T> {
    Idle,
    Running(Arming<T>),
    Stopped,
}

/// Everything spawned by one `start`.
struct Arming<T> {
    merged: Receiver<T>,
    /// Never sent on; dropping it disconnects every forwarder's copy of the
    /// receiving end, which is the shutdown broadcast.
    shutdown: Sender<()>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<T> Arming<T> {
    fn shut_down(self) {
        let Self {
            merged,
            shutdown,
            forwarders,
        } = self;
        drop(shutdown);
        join_forwarders(forwarders);
        drop(merged);
    }
}

fn join_forwarders(forwarders: Vec<JoinHandle<()>>) {
    for forwarder in forwarders {
        if forwarder.join().is_err() {
            warn!("fan-in forwarder panicked");
        }
    }
}

impl<T: Send + 'static> FanIn<T> {
    /// A fan-in without inputs whose merged stream is a rendezvous channel.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// A fan-in whose merged stream buffers up to `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                inputs: Vec::new(),
                lifecycle: Lifecycle::Idle,
            }),
            capacity,
        }
    }

    /// Register one input stream.
    ///
    /// Inputs registered while the fan-in is running are not picked up by
    /// the running forwarders; they join the next arming after
    /// [`close`](Self::close).
    pub fn add_input_channel(&self, input: Receiver<T>) {
        self.add_input_channels([input]);
    }

    /// Register several input streams, in order.
    pub fn add_input_channels(&self, inputs: impl IntoIterator<Item = Receiver<T>>) {
        let mut inner = self.inner.lock();
        let before = inner.inputs.len();
        inner.inputs.extend(inputs);
        if matches!(inner.lifecycle, Lifecycle::Running(_)) && inner.inputs.len() > before {
            warn!(
                "{} input(s) registered on a running fan-in; they are merged after the next re-arm",
                inner.inputs.len() - before
            );
        }
    }

    /// Number of registered inputs.
    pub fn input_count(&self) -> usize {
        self.inner.lock().inputs.len()
    }

    /// Start merging. Does nothing if already running.
    ///
    /// # Errors
    /// [`FanInError::Spawn`] if a forwarder thread could not be started; the
    /// fan-in is left in its previous state.
    pub fn start(&self) -> Result<(), FanInError> {
        self.arm(&mut self.inner.lock()).map(|_| ())
    }

    /// The merged stream of the current arming, starting the merge first if
    /// needed.
    ///
    /// # Errors
    /// Same as [`start`](Self::start).
    pub fn merged_channel(&self) -> Result<Receiver<T>, FanInError> {
        self.arm(&mut self.inner.lock()).cloned()
    }

    /// Stop the current arming and wait for its forwarders to exit.
    ///
    /// Elements a forwarder had already taken from its input but not yet
    /// delivered are dropped. Consumers still holding the old merged stream
    /// see it close. Closing an idle or stopped fan-in does nothing.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        match mem::replace(&mut inner.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(arming) => {
                debug!("closing fan-in with {} forwarder(s)", arming.forwarders.len());
                arming.shut_down();
            }
            previous => inner.lifecycle = previous,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FanInState {
        match self.inner.lock().lifecycle {
            Lifecycle::Idle => FanInState::Idle,
            Lifecycle::Running(_) => FanInState::Running,
            Lifecycle::Stopped => FanInState::Stopped,
        }
    }

    fn arm<'a>(&self, inner: &'a mut Inner<T>) -> Result<&'a Receiver<T>, FanInError> {
        if !matches!(inner.lifecycle, Lifecycle::Running(_)) {
            let arming = self.spawn_forwarders(&inner.inputs)?;
            debug!("fan-in started with {} input(s)", arming.forwarders.len());
            inner.lifecycle = Lifecycle::Running(arming);
        }
        match &inner.lifecycle {
            Lifecycle::Running(arming) => Ok(&arming.merged),
            Lifecycle::Idle | Lifecycle::Stopped => unreachable!("FanIn::arm: [1]"),
        }
    }

    fn spawn_forwarders(&self, inputs: &[Receiver<T>]) -> Result<Arming<T>, FanInError> {
        let (merged_sender, merged) = bounded(self.capacity);
        let (shutdown, shutdown_signal) = bounded(0);
        let mut forwarders = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let input = input.clone();
            let output = merged_sender.clone();
            let shutdown_signal = shutdown_signal.clone();
            let spawned = thread::Builder::new()
                .name(format!("{FORWARDER_NAME}-{index}"))
                .spawn(move || forward(index, input, output, shutdown_signal));
            match spawned {
                Ok(forwarder) => forwarders.push(forwarder),
                Err(source) => {
                    drop(shutdown);
                    join_forwarders(forwarders);
                    return Err(FanInError::Spawn {
                        input: index,
                        source,
                    });
                }
            }
        }
        // From here on only the forwarders hold senders of the merged stream,
        // so it closes exactly when the last of them exits.
        Ok(Arming {
            merged,
            shutdown,
            forwarders,
        })
    }
}

impl<T: Send + 'static> Default for FanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FanIn<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Lifecycle::Running(arming) = mem::replace(&mut inner.lifecycle, Lifecycle::Stopped) {
            arming.shut_down();
        }
    }
}

#[derive(Debug)]
enum Step {
    Forwarded,
    InputClosed,
    Shutdown,
}

fn forward<T>(index: usize, input: Receiver<T>, output: Sender<T>, shutdown: Receiver<()>) {
    trace!("fan-in forwarder {index} starting");
    let mut forwarded = 0usize;
    let reason = loop {
        let step = select! {
            recv(input) -> element => match element {
                // The arming holds the merged receiver until every forwarder
                // is joined, so a send only fails once teardown has begun.
                Ok(element) => select! {
                    send(output, element) -> sent => match sent {
                        Ok(()) => Step::Forwarded,
                        Err(_) => Step::Shutdown,
                    },
                    recv(shutdown) -> _ => Step::Shutdown,
                },
                Err(_) => Step::InputClosed,
            },
            recv(shutdown) -> _ => Step::Shutdown,
        };
        match step {
            Step::Forwarded => forwarded += 1,
            reason => break reason,
        }
    };
    trace!("fan-in forwarder {index} exiting after {forwarded} element(s): {reason:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{self, unbounded};
    use std::{thread, time::Duration};

    #[test_log::test]
    fn merges_all_inputs_preserving_per_input_order() {
        let fan_in = FanIn::new();
        let (a_sender, a) = unbounded();
        let (b_sender, b) = unbounded();
        fan_in.add_input_channels([a, b]);
        a_sender.send("a1").unwrap();
        a_sender.send("a2").unwrap();
        b_sender.send("b1").unwrap();
        drop(a_sender);
        drop(b_sender);

        let merged: Vec<_> = fan_in.merged_channel().unwrap().iter().collect();
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&"b1"));
        let a1 = merged.iter().position(|&x| x == "a1").unwrap();
        let a2 = merged.iter().position(|&x| x == "a2").unwrap();
        assert!(a1 < a2);
    }

    #[test_log::test]
    fn merged_stream_waits_for_every_input_to_close() {
        let fan_in = FanIn::new();
        let (open_sender, open) = unbounded::<u8>();
        fan_in.add_input_channel(stream::from_iter([1]));
        fan_in.add_input_channel(open);
        let merged = fan_in.merged_channel().unwrap();
        assert_eq!(merged.recv(), Ok(1));
        assert!(merged.recv_timeout(Duration::from_millis(20)).is_err());
        assert_eq!(fan_in.state(), FanInState::Running);
        open_sender.send(2).unwrap();
        drop(open_sender);
        assert_eq!(merged.recv(), Ok(2));
        assert!(merged.recv().is_err());
    }

    #[test_log::test]
    fn start_is_idempotent() {
        let fan_in = FanIn::new();
        fan_in.add_input_channel(stream::from_iter([7]));
        fan_in.start().unwrap();
        fan_in.start().unwrap();
        let merged = fan_in.merged_channel().unwrap();
        assert_eq!(merged.iter().collect::<Vec<_>>(), vec![7]);
    }

    #[test_log::test]
    fn no_inputs_closes_immediately() {
        let fan_in = FanIn::<u8>::new();
        assert_eq!(fan_in.state(), FanInState::Idle);
        assert!(fan_in.merged_channel().unwrap().recv().is_err());
        assert_eq!(fan_in.state(), FanInState::Running);
    }

    #[test_log::test]
    fn close_tears_down_forwarders_on_open_inputs() {
        let fan_in = FanIn::new();
        let (sender, input) = unbounded::<u32>();
        fan_in.add_input_channel(input);
        let merged = fan_in.merged_channel().unwrap();
        sender.send(1).unwrap();
        assert_eq!(merged.recv(), Ok(1));

        fan_in.close();
        assert_eq!(fan_in.state(), FanInState::Stopped);
        // Forwarders have exited even though `input` is still open.
        assert!(merged.recv().is_err());
        sender.send(2).unwrap();
        assert_eq!(sender.len(), 1);
    }

    #[test_log::test]
    fn close_then_start_re_arms_with_a_fresh_stream() {
        let fan_in = FanIn::new();
        let (sender, input) = unbounded::<u32>();
        fan_in.add_input_channel(input);
        let first = fan_in.merged_channel().unwrap();
        fan_in.close();
        assert!(first.recv().is_err());

        let (late_sender, late) = unbounded();
        fan_in.add_input_channel(late);
        assert_eq!(fan_in.input_count(), 2);
        let second = fan_in.merged_channel().unwrap();
        sender.send(10).unwrap();
        late_sender.send(20).unwrap();
        drop(sender);
        drop(late_sender);
        let mut merged: Vec<_> = second.iter().collect();
        merged.sort_unstable();
        assert_eq!(merged, vec![10, 20]);
    }

    #[test_log::test]
    fn close_unblocks_a_forwarder_stuck_on_a_slow_consumer() {
        let fan_in = FanIn::new();
        fan_in.add_input_channel(stream::from_iter([1, 2, 3]));
        let merged = fan_in.merged_channel().unwrap();
        assert_eq!(merged.recv(), Ok(1));
        // The forwarder now blocks handing over `2`.
        fan_in.close();
        assert!(merged.recv().is_err());
    }

    #[test_log::test]
    fn forwarders_outlive_dropped_consumers_until_close() {
        let fan_in = FanIn::new();
        let (sender, input) = unbounded::<u8>();
        fan_in.add_input_channel(input);
        drop(fan_in.merged_channel().unwrap());
        sender.send(1).unwrap();
        sender.send(2).unwrap();
        // The forwarder parks on handing `1` to the fan-in's own handle.
        while sender.len() > 1 {
            thread::yield_now();
        }
        assert_eq!(fan_in.state(), FanInState::Running);
        fan_in.close();
        assert_eq!(fan_in.state(), FanInState::Stopped);
        assert_eq!(sender.len(), 1);
        let merged = fan_in.merged_channel().unwrap();
        assert_eq!(merged.recv(), Ok(2));
    }

    #[test_log::test]
    fn closing_an_idle_fan_in_is_harmless() {
        let fan_in = FanIn::<u8>::new();
        fan_in.close();
        fan_in.add_input_channel(stream::from_iter([5]));
        assert_eq!(fan_in.merged_channel().unwrap().recv(), Ok(5));
    }

    #[test_log::test]
    fn dropping_a_running_fan_in_stops_its_forwarders() {
        let (sender, input) = unbounded::<u8>();
        let merged = {
            let fan_in = FanIn::new();
            fan_in.add_input_channel(input);
            fan_in.merged_channel().unwrap()
        };
        assert!(merged.recv().is_err());
        drop(sender);
    }
}
