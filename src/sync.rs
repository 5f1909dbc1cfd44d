//! Synchronization layer switchable between `parking_lot`/`std` and `loom`.
//!
//! Only the lock-based primitives (the key registry and the future result
//! cell) go through this module, so that they can be model checked. Both
//! backends expose the same surface: a non-poisoning `Mutex`, a `Condvar`
//! whose `wait*` methods consume and return the guard, `Arc`, and a detached
//! named `spawn`.

#[cfg(feature = "loom")]
mod imp {
    use core::time::Duration;
    pub(crate) use loom::sync::Arc;
    use std::io;

    pub(crate) type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

    pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(loom::sync::Mutex::new(val))
        }

        pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
            // Poisoning only happens if a model thread panicked, which already
            // fails the model.
            self.0.lock().unwrap()
        }
    }

    pub(crate) struct Condvar(loom::sync::Condvar);

    impl Condvar {
        pub(crate) fn new() -> Self {
            Self(loom::sync::Condvar::new())
        }

        pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
            self.0.wait(guard).unwrap()
        }

        /// `loom` has no notion of time, so a bounded wait is an unbounded one.
        pub(crate) fn wait_for<'a, T>(
            &self,
            guard: MutexGuard<'a, T>,
            _timeout: Duration,
        ) -> (MutexGuard<'a, T>, bool) {
            (self.wait(guard), false)
        }

        pub(crate) fn notify_all(&self) {
            self.0.notify_all();
        }
    }

    pub(crate) fn spawn<F>(_name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        loom::thread::spawn(f);
        Ok(())
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use core::time::Duration;
    pub(crate) use parking_lot::{Mutex, MutexGuard};
    pub(crate) use std::sync::Arc;
    use std::{io, thread};

    pub(crate) struct Condvar(parking_lot::Condvar);

    impl Condvar {
        pub(crate) fn new() -> Self {
            Self(parking_lot::Condvar::new())
        }

        pub(crate) fn wait<'a, T>(&self, mut guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
            self.0.wait(&mut guard);
            guard
        }

        /// Returns the reacquired guard and whether the wait timed out.
        pub(crate) fn wait_for<'a, T>(
            &self,
            mut guard: MutexGuard<'a, T>,
            timeout: Duration,
        ) -> (MutexGuard<'a, T>, bool) {
            let result = self.0.wait_for(&mut guard, timeout);
            (guard, result.timed_out())
        }

        pub(crate) fn notify_all(&self) {
            self.0.notify_all();
        }
    }

    pub(crate) fn spawn<F>(name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name).spawn(f).map(drop)
    }
}

pub(crate) use imp::*;
