//! Typed stream observation.

use crate::error::Fault;

/// Receives the decoded delivery of one stream.
pub trait StreamObserver<K, V>: Send + Sync {
    /// Handle an incoming value.
    fn on_value(&self, from: K, value: V);

    /// Handle an incoming error. Returning true escalates the error instead
    /// of considering it handled.
    fn on_error(&self, from: K, error: Fault) -> bool;

    /// Handle an incoming batch boundary of the given level.
    fn on_finish(&self, from: K, level: u32);

    /// Handle the stream being closed.
    fn on_closed(&self);
}

type ValueFn<K, V> = Box<dyn Fn(K, V) + Send + Sync>;
type ErrorFn<K> = Box<dyn Fn(K, Fault) -> bool + Send + Sync>;
type FinishFn<K> = Box<dyn Fn(K, u32) + Send + Sync>;
type ClosedFn = Box<dyn Fn() + Send + Sync>;

/// A fluent builder for stream listening.
///
/// ```no_run
/// use flowline::{Stream, StreamResponder};
///
/// let stream: Stream<i32> = Stream::new();
/// stream.observe(
///     StreamResponder::new()
///         .each(|_from, value: i32| println!("got {value}"))
///         .error(|_from, error| {
///             println!("failed: {error}");
///             false
///         })
///         .finish(|_from, level| println!("batch {level} done"))
///         .closed(|| println!("closed")),
/// );
/// stream.next(); // nothing arrives until the first demand
/// ```
pub struct StreamResponder<K, V> {
    value_fn: Option<ValueFn<K, V>>,
    error_fn: Option<ErrorFn<K>>,
    finish_fn: Option<FinishFn<K>>,
    closed_fn: Option<ClosedFn>,
}

impl<K, V> StreamResponder<K, V> {
    pub fn new() -> Self {
        StreamResponder {
            value_fn: None,
            error_fn: None,
            finish_fn: None,
            closed_fn: None,
        }
    }

    /// Listen for each incoming value.
    pub fn each<F>(mut self, handler: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.value_fn = Some(Box::new(handler));
        self
    }

    /// Listen for errors. The handler decides whether the error escalates.
    pub fn error<F>(mut self, handler: F) -> Self
    where
        F: Fn(K, Fault) -> bool + Send + Sync + 'static,
    {
        self.error_fn = Some(Box::new(handler));
        self
    }

    /// Listen for batch boundaries.
    pub fn finish<F>(mut self, handler: F) -> Self
    where
        F: Fn(K, u32) + Send + Sync + 'static,
    {
        self.finish_fn = Some(Box::new(handler));
        self
    }

    /// Listen for the stream closing.
    pub fn closed<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.closed_fn = Some(Box::new(handler));
        self
    }
}

impl<K, V> StreamObserver<K, V> for StreamResponder<K, V> {
    fn on_value(&self, from: K, value: V) {
        if let Some(value_fn) = &self.value_fn {
            value_fn(from, value);
        }
    }

    fn on_error(&self, from: K, error: Fault) -> bool {
        match &self.error_fn {
            Some(error_fn) => error_fn(from, error),
            None => {
                // documented pitfall: nobody observes this error
                log::warn!("unobserved stream error: {error}");
                false
            }
        }
    }

    fn on_finish(&self, from: K, level: u32) {
        if let Some(finish_fn) = &self.finish_fn {
            finish_fn(from, level);
        }
    }

    fn on_closed(&self) {
        if let Some(closed_fn) = &self.closed_fn {
            closed_fn();
        }
    }
}
