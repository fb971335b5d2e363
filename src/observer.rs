//! Continuation records and outcome adoption.
//!
//! Every registration on a [`Promise`] appends one observer record: the
//! handler plus the derived promise it settles. When the source settles, the
//! dispatch loop feeds the terminal [`Outcome`] to each record in
//! registration order; the record runs its handler (or skips it, depending on
//! the outcome kind) and settles its derived promise through the internal
//! settlement entry point. A settling promise never writes another promise's
//! state directly.

use crate::promise::{Outcome, Promise};

/// The successful product of a fulfillment handler: either a plain value, or
/// another promise whose eventual outcome the derived promise adopts.
pub enum Chain<T, E> {
    /// Fulfill the derived promise with this value.
    Value(T),
    /// Settle the derived promise however this promise eventually settles,
    /// even if that happens much later.
    Promise(Promise<T, E>),
}

pub(crate) trait Observer<T, E>: Send {
    /// Consumes the record, running its handler and settling its derived
    /// promise according to `outcome`.
    fn on_settled(self: Box<Self>, outcome: &Outcome<T, E>);
}

/// Record created by [`Promise::then`].
pub(crate) struct ThenObserver<U, E, F> {
    pub(crate) on_fulfilled: F,
    pub(crate) derived: Promise<U, E>,
}

impl<T, U, E, F> Observer<T, E> for ThenObserver<U, E, F>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(T) -> Result<Chain<U, E>, E> + Send,
{
    fn on_settled(self: Box<Self>, outcome: &Outcome<T, E>) {
        let Self {
            on_fulfilled,
            derived,
        } = *self;
        match outcome {
            // Rejections skip the handler and pass through unchanged.
            Outcome::Rejected(reason) => derived.settle(Outcome::Rejected(reason.clone())),
            Outcome::Fulfilled(value) => match on_fulfilled(value.clone()) {
                Ok(Chain::Value(value)) => derived.settle(Outcome::Fulfilled(value)),
                Ok(Chain::Promise(inner)) => inner.adopt(derived),
                Err(reason) => derived.settle(Outcome::Rejected(reason)),
            },
        }
    }
}

/// Record created by [`Promise::catch`].
pub(crate) struct CatchObserver<T, E, F> {
    pub(crate) on_rejected: F,
    pub(crate) derived: Promise<Option<T>, E>,
}

impl<T, E, F> Observer<T, E> for CatchObserver<T, E, F>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(E) + Send,
{
    fn on_settled(self: Box<Self>, outcome: &Outcome<T, E>) {
        let Self {
            on_rejected,
            derived,
        } = *self;
        match outcome {
            // Fulfillments skip the handler; the value passes through.
            Outcome::Fulfilled(value) => derived.settle(Outcome::Fulfilled(Some(value.clone()))),
            // The handler consumes the rejection; the derived promise
            // fulfills empty.
            Outcome::Rejected(reason) => {
                on_rejected(reason.clone());
                derived.settle(Outcome::Fulfilled(None));
            }
        }
    }
}

/// Record created by [`Promise::finally`].
pub(crate) struct FinallyObserver<T, E, F> {
    pub(crate) on_settled: F,
    pub(crate) derived: Promise<T, E>,
}

impl<T, E, F> Observer<T, E> for FinallyObserver<T, E, F>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce() + Send,
{
    fn on_settled(self: Box<Self>, outcome: &Outcome<T, E>) {
        let Self {
            on_settled,
            derived,
        } = *self;
        on_settled();
        derived.settle(outcome.clone());
    }
}

/// Forwards an adopted promise's outcome to the derived promise that adopted
/// it.
pub(crate) struct AdoptObserver<T, E> {
    pub(crate) derived: Promise<T, E>,
}

impl<T, E> Observer<T, E> for AdoptObserver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn on_settled(self: Box<Self>, outcome: &Outcome<T, E>) {
        self.derived.settle(outcome.clone());
    }
}
