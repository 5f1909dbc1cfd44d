//! Streams are `crossbeam` channels: closable, multi-producer and
//! multi-consumer, with blocking `send`/`recv`. A stream is closed once every
//! [`Sender`] is dropped; receivers then drain the buffered elements and see
//! the end of the stream.

pub use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

/// Returns an already closed stream yielding `items` in order.
pub fn from_iter<T>(items: impl IntoIterator<Item = T>) -> Receiver<T> {
    let (sender, receiver) = unbounded();
    for item in items {
        // Unbounded and the receiver is still alive.
        sender.send(item).expect("stream::from_iter: [1]");
    }
    receiver
}
