//! Poison-free locking primitives.
//!
//! Continuation handlers are arbitrary user code, and so are the `Clone`
//! impls of the values and reasons a promise carries. A panic in either is
//! isolated by the dispatch loop, but with [`std::sync::Mutex`] it would also
//! poison the promise's lock and turn every later settlement or registration
//! into an `unwrap` panic. These wrappers recover the guard from a poisoned
//! lock instead, so a single misbehaving handler cannot wedge the promise it
//! was attached to.

use std::{
    ops::{Deref, DerefMut},
    sync,
    time::Duration,
};

pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let guard = match self.inner.wait(guard.inner) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    /// Like [`Condvar::wait`], but gives up after `dur`.
    ///
    /// Callers re-check their predicate in a loop either way, so the timeout
    /// flag is not reported back.
    pub fn wait_timeout<'a, T>(&self, guard: MutexGuard<'a, T>, dur: Duration) -> MutexGuard<'a, T> {
        let (guard, _) = match self.inner.wait_timeout(guard.inner, dur) {
            Ok(out) => out,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}
