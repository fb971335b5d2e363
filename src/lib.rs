//! Settle-once promises with chainable continuations for threaded code.
//!
//! (if you're looking for running large numbers of I/O tasks concurrently,
//! you're probably better served by an `async` runtime; this library is for
//! plain threaded code that wants to hand eventual results around without
//! blocking on them)
//!
//! # Overview
//!
//! A [`Promise`] represents a value or failure that becomes available at an
//! unknown future time. It starts out unsettled, transitions **exactly once**
//! to either fulfilled (carrying a value) or rejected (carrying a reason),
//! and never changes again. Any number of continuations can be attached with
//! [`Promise::then`], [`Promise::catch`] and [`Promise::finally`], before or
//! after that transition, with identical observable behavior; each
//! registration returns a new derived [`Promise`] that settles from the
//! handler's result, so continuations chain.
//!
//! Promises are produced four ways: already fulfilled
//! ([`Promise::from_value`]), already rejected ([`Promise::from_error`]),
//! manually settleable ([`Promise::pending`], driven by [`Promise::fulfill`]
//! and [`Promise::reject`]), or backed by a task thread
//! ([`Promise::from_task`]).
//!
//! When a fulfillment handler returns another promise instead of a plain
//! value ([`Chain::Promise`]), the derived promise adopts that inner
//! promise's eventual outcome rather than treating the promise itself as the
//! value. This is what makes `then` chains flatten.
//!
//! # Ordering
//!
//! Continuations attached to the same promise before it settles run in
//! registration order, each exactly once. A continuation attached after
//! settlement runs immediately, on its own thread. No ordering is guaranteed
//! between continuations of *different* promises, even related ones.
//!
//! Handlers never run on the thread that registers or settles a promise;
//! each settlement dispatches its continuation batch on a fresh thread.
//!
//! # Examples
//!
//! Chaining a transformation over a task's eventual result:
//!
//! ```
//! use thenable::{Chain, Outcome, Promise};
//!
//! let promise = Promise::<i32, String>::from_task(|resolver, _rejector| {
//!     resolver.resolve(42);
//! });
//! let answer = promise.then(|value| Ok(Chain::Value(value + 1)));
//! assert_eq!(answer.wait(), Outcome::Fulfilled(43));
//! ```
//!
//! Driving a pending promise by hand; settling twice is an error:
//!
//! ```
//! use thenable::{Chain, Outcome, Promise};
//!
//! let promise = Promise::<i32, String>::pending();
//! let doubled = promise.then(|value| Ok(Chain::Value(value * 2)));
//!
//! promise.fulfill(21).unwrap();
//! assert!(promise.fulfill(0).is_err());
//! assert_eq!(doubled.wait(), Outcome::Fulfilled(42));
//! ```
//!
//! Rejections skip fulfillment handlers and are absorbed by `catch`:
//!
//! ```
//! use thenable::{Outcome, Promise};
//!
//! let promise = Promise::<i32, String>::from_error("flat tire".into());
//! let recovered = promise.catch(|reason| eprintln!("ignoring: {reason}"));
//! assert_eq!(recovered.wait(), Outcome::Fulfilled(None));
//! ```

mod observer;
mod promise;
mod sync;

pub use crate::observer::Chain;
pub use crate::promise::{NotPendingError, Outcome, Promise, Rejector, Resolver};
