//! A thread-safe value cell that notifies subscribers of every change.
//!
//! This crate implements the [Observer pattern][] for values that are
//! written from many threads. A [`Cell<T>`] holds a value behind an exclusive
//! lock and a list of subscriber callbacks. The callbacks are owned by a
//! dispatcher thread that runs them one instruction at a time, so no lock is
//! held while a subscriber runs and writers never wait for subscribers.
//!
//! Here is a quick walk-through:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use watchcell::Cell;
//!
//! let cell = Cell::new(1);
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! // The callback is called with the current value before `subscribe`
//! // returns, and with every value written afterwards.
//! let mut subscription = cell.subscribe({
//!     let seen = seen.clone();
//!     move |value: &i32| seen.lock().unwrap().push(*value)
//! });
//! assert_eq!(*seen.lock().unwrap(), [1]);
//!
//! // Writes return as soon as the new value has been handed to the
//! // dispatcher. `wait` blocks until those deliveries are done.
//! cell.set(2);
//! cell.update(|value| value * 10);
//! cell.wait();
//! assert_eq!(*seen.lock().unwrap(), [1, 2, 20]);
//!
//! // After `unsubscribe` returns, the callback is never called again.
//! subscription.unsubscribe();
//! cell.set(3);
//! assert_eq!(*seen.lock().unwrap(), [1, 2, 20]);
//! assert_eq!(cell.get(), 3);
//! ```
//!
//! # Ordering
//!
//! Writes are totally ordered by the cell's lock and each write that isn't
//! skipped by the cell's [`SkipPolicy`] is enqueued for delivery while the
//! lock is still held, so every subscriber observes values in commit order.
//! The order in which different subscribers are called for the same value is
//! unspecified.
//!
//! # Re-entrancy
//!
//! Subscriber callbacks run on the dispatcher thread. They may write to any
//! cell, including their own, and subscribe to or unsubscribe from other
//! cells. Functions that would wait for the dispatcher ([`Cell::wait`],
//! [`Subscription::unsubscribe`], [`Cell::subscribe`]) don't block when called
//! from a callback of the same cell. Updater closures passed to
//! [`Cell::update`] run under the cell's lock and must not access that cell.
//!
//! # Panics in subscribers
//!
//! By default ([`PanicPolicy::Propagate`]) a panicking subscriber stops its
//! dispatcher: the remaining subscribers don't receive the value, all
//! subscriptions are discarded and further writes notify nobody until the
//! next [`Cell::subscribe`]. The writer whose value triggered the panic is
//! not affected. [`PanicPolicy::Isolate`] instead logs the panic and keeps
//! delivering.
//!
//! Cargo features:
//!
//! - `tracing`: Emit [tracing] events when dispatchers start and stop, when
//!   values are delivered and when subscribers panic
//!
//! [Observer pattern]: https://en.wikipedia.org/wiki/Observer_pattern
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms, unreachable_pub)]
// https://github.com/rust-lang/rust-clippy/issues/10486
#![allow(clippy::double_must_use)]

mod cell;
mod dispatcher;
pub mod policy;
mod stream;
mod subscription;

#[doc(inline)]
pub use cell::{Cell, CellBuilder};
#[doc(inline)]
pub use policy::{NeverSkip, PanicPolicy, SkipEq, SkipHash, SkipPolicy};
#[doc(inline)]
pub use stream::ValueStream;
#[doc(inline)]
pub use subscription::{SubscriberId, Subscription};
