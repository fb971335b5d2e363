//! The settle-once promise type and its settlement machinery.

use std::{
    mem,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    observer::{AdoptObserver, CatchObserver, Chain, FinallyObserver, Observer, ThenObserver},
    sync::{Condvar, Mutex, MutexGuard},
};

/// Settlement state of a [`Promise`].
enum State<T, E> {
    /// No producer action has occurred yet. Continuations queue up, and
    /// manual settlement is available.
    Unsettled,
    /// The instance is reserved for internal settlement: a task callback is
    /// still running, or a derived promise is waiting for its source. Manual
    /// settlement is rejected.
    Settling,
    Fulfilled(T),
    Rejected(E),
}

impl<T: Clone, E: Clone> State<T, E> {
    /// Returns a snapshot of the terminal outcome, or `None` while the
    /// promise can still settle.
    fn outcome(&self) -> Option<Outcome<T, E>> {
        match self {
            State::Unsettled | State::Settling => None,
            State::Fulfilled(value) => Some(Outcome::Fulfilled(value.clone())),
            State::Rejected(reason) => Some(Outcome::Rejected(reason.clone())),
        }
    }
}

/// The terminal result of a settled [`Promise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Fulfilled(T),
    Rejected(E),
}

/// Error returned by the manual settlement operations.
///
/// Manual settlement is only available on an instance that is currently
/// unsettled: one created by [`Promise::pending`] and not yet settled, or a
/// task-backed instance whose task finished without settling it. Everywhere
/// else (already settled, task still running, or a derived promise produced
/// by a registration method) [`Promise::fulfill`] and [`Promise::reject`]
/// fail with this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotPendingError {
    /// [`Promise::fulfill`] was called on a promise that cannot be manually
    /// settled.
    #[error("cannot fulfill a promise that is not in the pending state")]
    Fulfill,
    /// [`Promise::reject`] was called on a promise that cannot be manually
    /// settled.
    #[error("cannot reject a promise that is not in the pending state")]
    Reject,
}

struct Shared<T, E> {
    inner: Mutex<Inner<T, E>>,
    condvar: Condvar,
}

struct Inner<T, E> {
    state: State<T, E>,
    /// Continuations queued while the promise is not yet terminal, in
    /// registration order. Drained exactly once, at settlement.
    observers: Vec<Box<dyn Observer<T, E>>>,
}

/// A settle-once container for an eventual value of type `T` or failure of
/// type `E`.
///
/// A [`Promise`] transitions exactly once from unsettled to either fulfilled
/// or rejected, and is immutable afterwards. Continuations attached with
/// [`Promise::then`], [`Promise::catch`] and [`Promise::finally`] observe
/// that transition whether they were registered before or after it; each
/// registration returns a new derived [`Promise`] settled from the handler's
/// result.
///
/// [`Promise`] is a cheap handle: cloning it produces another reference to
/// the same logical instance, which is how producers and consumers on
/// different threads share one promise.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Promise<T, E> {
    fn with_state(state: State<T, E>) -> Self {
        Promise {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    observers: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates an already-fulfilled promise carrying `value`.
    pub fn from_value(value: T) -> Self {
        Self::with_state(State::Fulfilled(value))
    }

    /// Creates an already-rejected promise carrying `reason`.
    pub fn from_error(reason: E) -> Self {
        Self::with_state(State::Rejected(reason))
    }

    /// Creates an unsettled promise with no backing task.
    ///
    /// The instance settles only when a caller invokes [`Promise::fulfill`]
    /// or [`Promise::reject`] on it.
    pub fn pending() -> Self {
        Self::with_state(State::Unsettled)
    }

    /// Returns whether the promise has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.shared.inner.lock().state,
            State::Fulfilled(_) | State::Rejected(_)
        )
    }

    /// Reverts a task-backed instance to the manually settleable state.
    ///
    /// Called by the task thread once the task has returned; a no-op if the
    /// task already settled the promise.
    fn degrade(&self) {
        let mut inner = self.shared.inner.lock();
        if matches!(inner.state, State::Settling) {
            inner.state = State::Unsettled;
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a promise backed by a task running on its own thread.
    ///
    /// `task` receives a [`Resolver`] and a [`Rejector`]. Both may be called
    /// any number of times; the first call of either settles the promise and
    /// every later call is silently ignored. If the task returns without
    /// calling either, the promise becomes manually settleable, exactly as
    /// if it had been created with [`Promise::pending`].
    ///
    /// The task runs to completion; there is no way to cancel it.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::{Outcome, Promise};
    ///
    /// let promise = Promise::<u32, String>::from_task(|resolver, _rejector| {
    ///     resolver.resolve(6 * 7);
    /// });
    /// assert_eq!(promise.wait(), Outcome::Fulfilled(42));
    /// ```
    pub fn from_task<F>(task: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejector<T, E>) + Send + 'static,
    {
        let promise = Self::with_state(State::Settling);
        let resolver = Resolver {
            promise: promise.clone(),
        };
        let rejector = Rejector {
            promise: promise.clone(),
        };
        let handle = promise.clone();
        thread::spawn(move || {
            log::trace!("promise task starting");
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(resolver, rejector)));
            handle.degrade();
            if result.is_err() {
                log::error!("promise task panicked; the promise degrades to pending if it was not settled");
            }
            log::trace!("promise task finished");
        });
        promise
    }

    /// Manually fulfills the promise with `value`.
    ///
    /// Succeeds only while the promise is unsettled with no pending internal
    /// settlement; see [`NotPendingError`]. On success, every queued
    /// continuation is dispatched in registration order.
    pub fn fulfill(&self, value: T) -> Result<(), NotPendingError> {
        let inner = self.shared.inner.lock();
        if matches!(inner.state, State::Unsettled) {
            self.finish(inner, Outcome::Fulfilled(value));
            Ok(())
        } else {
            Err(NotPendingError::Fulfill)
        }
    }

    /// Manually rejects the promise with `reason`.
    ///
    /// Symmetric to [`Promise::fulfill`].
    pub fn reject(&self, reason: E) -> Result<(), NotPendingError> {
        let inner = self.shared.inner.lock();
        if matches!(inner.state, State::Unsettled) {
            self.finish(inner, Outcome::Rejected(reason));
            Ok(())
        } else {
            Err(NotPendingError::Reject)
        }
    }

    /// Registers a fulfillment handler and returns the derived promise.
    ///
    /// Once this promise fulfills, `on_fulfilled` runs with a clone of the
    /// value. Its result settles the derived promise: [`Chain::Value`]
    /// fulfills it, [`Chain::Promise`] makes it adopt the inner promise's
    /// eventual outcome, and `Err` rejects it. If this promise rejects
    /// instead, the handler is skipped and the rejection passes through to
    /// the derived promise unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::{Chain, Outcome, Promise};
    ///
    /// let promise = Promise::<i32, String>::from_value(42);
    /// let next = promise.then(|value| Ok(Chain::Value(value + 1)));
    /// assert_eq!(next.wait(), Outcome::Fulfilled(43));
    /// ```
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Chain<U, E>, E> + Send + 'static,
    {
        let derived = Promise::with_state(State::Settling);
        self.register(Box::new(ThenObserver {
            on_fulfilled,
            derived: derived.clone(),
        }));
        derived
    }

    /// Registers a rejection handler and returns the derived promise.
    ///
    /// Once this promise rejects, `on_rejected` runs with a clone of the
    /// reason and the derived promise fulfills with `None`: the rejection is
    /// considered handled and does not propagate further. If this promise
    /// fulfills instead, the handler is skipped and the derived promise
    /// fulfills with `Some(value)`.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<Option<T>, E>
    where
        F: FnOnce(E) + Send + 'static,
    {
        let derived = Promise::with_state(State::Settling);
        self.register(Box::new(CatchObserver {
            on_rejected,
            derived: derived.clone(),
        }));
        derived
    }

    /// Registers a handler that runs on either outcome, and returns the
    /// derived promise.
    ///
    /// `on_settled` takes no arguments and cannot alter the outcome: the
    /// derived promise settles with the exact same value or reason as this
    /// one, after the handler has run.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let derived = Promise::with_state(State::Settling);
        self.register(Box::new(FinallyObserver {
            on_settled,
            derived: derived.clone(),
        }));
        derived
    }

    /// Blocks the calling thread until the promise settles, returning a
    /// clone of its outcome.
    ///
    /// This is a convenience for code that has nothing else to do; promise
    /// chains themselves never block.
    pub fn wait(&self) -> Outcome<T, E> {
        let mut inner = self.shared.inner.lock();
        loop {
            match inner.state.outcome() {
                Some(outcome) => return outcome,
                None => inner = self.shared.condvar.wait(inner),
            }
        }
    }

    /// Like [`Promise::wait`], but gives up after `timeout` and returns
    /// `None` if the promise has not settled by then.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(outcome) = inner.state.outcome() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self.shared.condvar.wait_timeout(inner, deadline - now);
        }
    }

    /// Internal settlement, used by task capabilities and by observers
    /// settling the derived promises they own.
    ///
    /// Only effective while the promise is reserved for internal settlement;
    /// every other call is silently ignored, which is what makes the first
    /// resolve-or-reject call inside a task win.
    pub(crate) fn settle(&self, outcome: Outcome<T, E>) {
        let inner = self.shared.inner.lock();
        if matches!(inner.state, State::Settling) {
            self.finish(inner, outcome);
        }
    }

    /// Makes `derived` settle with this promise's eventual outcome.
    pub(crate) fn adopt(&self, derived: Promise<T, E>) {
        self.register(Box::new(AdoptObserver { derived }));
    }

    /// Appends a continuation, or dispatches it immediately if the promise
    /// is already terminal.
    pub(crate) fn register(&self, observer: Box<dyn Observer<T, E>>) {
        let mut inner = self.shared.inner.lock();
        match inner.state.outcome() {
            None => inner.observers.push(observer),
            // Already terminal: the queue was drained at settlement, so this
            // observer dispatches on its own, with a snapshot of the outcome.
            Some(outcome) => {
                drop(inner);
                dispatch(vec![observer], outcome);
            }
        }
    }

    /// Performs the settlement transition. The caller has already checked
    /// the state; `finish` stores the outcome, wakes blocked waiters, and
    /// hands the drained continuation queue to a dispatch thread.
    fn finish(&self, mut inner: MutexGuard<'_, Inner<T, E>>, outcome: Outcome<T, E>) {
        let snapshot = outcome.clone();
        inner.state = match outcome {
            Outcome::Fulfilled(value) => State::Fulfilled(value),
            Outcome::Rejected(reason) => State::Rejected(reason),
        };
        let observers = mem::take(&mut inner.observers);
        drop(inner);

        self.shared.condvar.notify_all();
        dispatch(observers, snapshot);
    }
}

/// Runs a batch of continuations, in order, on a fresh thread.
///
/// Handlers never run on the thread that settled the promise (or registered
/// the continuation): settling a long chain would otherwise recurse through
/// every link on one stack. Each observer dispatch is isolated, so a
/// panicking handler cannot prevent its siblings from running.
fn dispatch<T, E>(observers: Vec<Box<dyn Observer<T, E>>>, outcome: Outcome<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    if observers.is_empty() {
        return;
    }

    thread::spawn(move || {
        log::trace!("dispatching {} continuation(s)", observers.len());
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer.on_settled(&outcome))).is_err() {
                log::error!("a continuation handler panicked; its derived promise will not settle");
            }
        }
    });
}

/// The fulfillment capability handed to a task spawned by
/// [`Promise::from_task`].
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Resolver {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Fulfills the task's promise with `value`.
    ///
    /// The first resolve-or-reject call made by the task wins; every later
    /// call, and any call made after the task has already returned without
    /// settling, is silently ignored.
    pub fn resolve(&self, value: T) {
        self.promise.settle(Outcome::Fulfilled(value));
    }
}

/// The rejection capability handed to a task spawned by
/// [`Promise::from_task`].
pub struct Rejector<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Rejector<T, E> {
    fn clone(&self) -> Self {
        Rejector {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Rejector<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Rejects the task's promise with `reason`.
    ///
    /// Subject to the same first-call-wins rule as [`Resolver::resolve`].
    pub fn reject(&self, reason: E) {
        self.promise.settle(Outcome::Rejected(reason));
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use crate::test::{eventually, silent_panic, Recorder};

    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn constructors_produce_the_advertised_states() {
        let fulfilled = Promise::<i32, String>::from_value(5);
        assert!(fulfilled.is_settled());
        assert_eq!(fulfilled.wait(), Outcome::Fulfilled(5));

        let rejected = Promise::<i32, String>::from_error("boom".into());
        assert!(rejected.is_settled());
        assert_eq!(rejected.wait(), Outcome::Rejected("boom".into()));

        let pending = Promise::<i32, String>::pending();
        assert!(!pending.is_settled());
        assert_eq!(pending.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn manual_settlement_fulfills_exactly_once() {
        let promise = Promise::<i32, String>::pending();
        assert_eq!(promise.fulfill(7), Ok(()));
        assert_eq!(promise.fulfill(8), Err(NotPendingError::Fulfill));
        assert_eq!(promise.reject("late".into()), Err(NotPendingError::Reject));
        assert_eq!(promise.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn manual_settlement_rejects_exactly_once() {
        let promise = Promise::<i32, String>::pending();
        assert_eq!(promise.reject("boom".into()), Ok(()));
        assert_eq!(promise.reject("later".into()), Err(NotPendingError::Reject));
        assert_eq!(promise.fulfill(1), Err(NotPendingError::Fulfill));
        assert_eq!(promise.wait(), Outcome::Rejected("boom".into()));
    }

    #[test]
    fn terminal_constructors_refuse_manual_settlement() {
        let fulfilled = Promise::<i32, String>::from_value(1);
        assert_eq!(fulfilled.fulfill(2), Err(NotPendingError::Fulfill));
        assert_eq!(fulfilled.reject("no".into()), Err(NotPendingError::Reject));

        let rejected = Promise::<i32, String>::from_error("no".into());
        assert_eq!(rejected.fulfill(2), Err(NotPendingError::Fulfill));
        assert_eq!(rejected.reject("no".into()), Err(NotPendingError::Reject));
    }

    #[test]
    fn handlers_do_not_rerun_on_a_failed_second_settlement() {
        let recorder = Recorder::new();
        let promise = Promise::<i32, String>::pending();
        let r = recorder.clone();
        let derived = promise.then(move |value| {
            r.mark("then");
            Ok(Chain::Value(value))
        });
        promise.fulfill(7).unwrap();
        recorder.expect(&["then"]);
        assert_eq!(promise.fulfill(8), Err(NotPendingError::Fulfill));
        recorder.expect_silence();
        assert_eq!(derived.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn concurrent_settlement_lets_exactly_one_call_win() {
        let promise = Promise::<usize, usize>::pending();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handles = Vec::new();
        for i in 0..8 {
            let promise = promise.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let won = if i % 2 == 0 {
                    promise.fulfill(i).is_ok()
                } else {
                    promise.reject(i).is_ok()
                };
                tx.send((i, won)).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);

        let winners: Vec<usize> = rx.iter().filter(|&(_, won)| won).map(|(i, _)| i).collect();
        assert_eq!(winners.len(), 1);
        let winner = winners[0];
        let expected = if winner % 2 == 0 {
            Outcome::Fulfilled(winner)
        } else {
            Outcome::Rejected(winner)
        };
        assert_eq!(promise.wait(), expected);
    }

    #[test]
    fn task_backed_promise_blocks_manual_settlement_while_running() {
        let (release, gate) = bounded::<()>(0);
        let promise = Promise::<i32, String>::from_task(move |_resolver, _rejector| {
            gate.recv().unwrap();
        });
        assert_eq!(promise.fulfill(1), Err(NotPendingError::Fulfill));
        assert_eq!(promise.reject("no".into()), Err(NotPendingError::Reject));
        release.send(()).unwrap();
        assert!(eventually(|| promise.fulfill(7).is_ok()));
        assert_eq!(promise.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn unsettled_task_degrades_to_a_pending_promise() {
        let promise = Promise::<i32, String>::from_task(|_resolver, _rejector| {});
        assert!(eventually(|| promise.fulfill(7).is_ok()));
        assert_eq!(promise.fulfill(8), Err(NotPendingError::Fulfill));
        assert_eq!(promise.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn first_task_resolution_wins() {
        let promise = Promise::<i32, String>::from_task(|resolver, rejector| {
            resolver.resolve(1);
            rejector.reject("late".into());
            resolver.resolve(2);
        });
        assert_eq!(promise.wait(), Outcome::Fulfilled(1));
    }

    #[test]
    fn first_task_rejection_wins() {
        let promise = Promise::<i32, String>::from_task(|resolver, rejector| {
            rejector.reject("boom".into());
            resolver.resolve(1);
            rejector.reject("again".into());
        });
        assert_eq!(promise.wait(), Outcome::Rejected("boom".into()));
    }

    #[test]
    fn escaped_resolver_is_inert_after_manual_settlement() {
        let (tx, rx) = bounded(1);
        let promise = Promise::<i32, String>::from_task(move |resolver, _rejector| {
            tx.send(resolver).unwrap();
        });
        let escaped = rx.recv().unwrap();
        assert!(eventually(|| promise.fulfill(7).is_ok()));
        escaped.resolve(5);
        assert_eq!(promise.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn panicking_task_degrades_to_a_pending_promise() {
        let promise = Promise::<i32, String>::from_task(|_resolver, _rejector| {
            silent_panic("task panic".into());
        });
        assert!(eventually(|| promise.fulfill(7).is_ok()));
        assert_eq!(promise.wait(), Outcome::Fulfilled(7));
    }

    #[test]
    fn wait_blocks_until_settlement() {
        let promise = Promise::<i32, String>::pending();
        let settler = {
            let promise = promise.clone();
            thread::spawn(move || promise.fulfill(3))
        };
        assert_eq!(promise.wait(), Outcome::Fulfilled(3));
        settler.join().unwrap().unwrap();
    }

    #[test]
    fn promise_and_capabilities_are_send() {
        assert_send::<Promise<i32, String>>();
        assert_send::<Resolver<i32, String>>();
        assert_send::<Rejector<i32, String>>();
    }
}
