//! Multicast notification streams with optional bounded replay.
//!
//! This crate is the leaf of the `eventide` workspace. Every client above it
//! (event subscriptions, typed replay clients, the transaction client) moves
//! values between background tasks through the types defined here.
//!
//! # Key Components
//!
//! *   [`Observable`]: a broadcast source. Each [`Observer`] obtained through
//!     [`Observable::subscribe`] receives every value published after it subscribed.
//! *   [`ReplayObservable`]: an observable that also keeps the last N values and hands
//!     them to late subscribers before any live value.
//! *   [`Publisher`]: the private publish handle returned by the constructors. Dropping
//!     it terminates the observable.
//! *   [`either`]: the value-or-error shapes used to carry errors through observables
//!     without terminating them, and [`AsyncError`] for fallible operations that
//!     complete later.
//!
//! Cancellation is expressed with [`tokio_util::sync::CancellationToken`]; an
//! observer's delivery channel closes as soon as the token it subscribed with is
//! cancelled.

pub mod either;
mod observable;
/// Free functions that drain or transform observables.
pub mod operators;
mod replay;

pub use either::{error_channel, AsyncError, Either, ErrorHandle, ErrorSender};
pub use observable::{Observable, Observer, Publisher, DEFAULT_OBSERVER_BUFFER};
pub use operators::{for_each, map, map_replay};
pub use replay::ReplayObservable;
