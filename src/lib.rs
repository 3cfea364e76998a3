//! Flowline - actors, promises and flow-controlled streams.
//!
//! An in-process concurrency toolkit built from three composable primitives:
//! serialized message [`Actor`]s, single-fulfilment [`Promise`]s with a
//! distinct error channel, and pull-driven [`Stream`]s that can be fanned out
//! to multiple consumers via [`Splitter`] and [`LoadBalancer`].

mod actor;
mod config;
mod error;
mod observe;
mod promise;
mod stream;

pub use actor::{Actor, Done};
pub use config::{DEFAULT_MAX_BUFFER, StreamConfig};
pub use error::{Fault, HandlerError};
pub use observe::{Publisher, Subscription};
pub use promise::{Promise, Task, spawn, spawn_blocking};
pub use stream::{
    Command, Entry, LoadBalancer, Splitter, Stream, StreamObserver, StreamResponder,
};
