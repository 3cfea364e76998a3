//! Promises and tasks.
//!
//! A [`Promise`] is a publisher of a single result that may arrive later.
//! It fulfils exactly once, replays its entry to late subscribers, and after
//! fulfilment still accepts corrective [`Entry::Error`] entries, each of
//! which overwrites the stored entry and re-notifies. A [`Task`] is a promise
//! of a content-free completion signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Fault, HandlerError};
use crate::observe::{ObserverFn, Publisher, Subscription};
use crate::stream::Entry;

/// A single-fulfilment future with a distinct error channel.
///
/// Cloning yields another handle to the same promise.
pub struct Promise<K, V> {
    inner: Arc<PromiseInner<K, V>>,
}

impl<K, V> Clone for Promise<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PromiseInner<K, V> {
    publisher: Publisher<Entry<K, V>>,
    fulfilled: AtomicBool,
    entry: Mutex<Option<Entry<K, V>>>,
    has_value_handler: AtomicBool,
    has_error_handler: AtomicBool,
    operation: Mutex<Option<String>>,
}

/// A promise of completion, where only done/failed matters.
pub type Task = Promise<(), ()>;

impl Promise<(), ()> {
    /// Fulfil the task.
    pub fn complete(&self) {
        self.set(());
    }
}

impl<K, V> Promise<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(PromiseInner {
                publisher: Publisher::new(),
                fulfilled: AtomicBool::new(false),
                entry: Mutex::new(None),
                has_value_handler: AtomicBool::new(false),
                has_error_handler: AtomicBool::new(false),
                operation: Mutex::new(None),
            }),
        }
    }

    /// Drive an entry into the promise.
    ///
    /// Accepted when the promise is not yet fulfilled, or when the entry is
    /// an error (a corrective error overwrites the stored entry and
    /// re-notifies). Anything else is dropped.
    pub fn apply(&self, entry: Entry<K, V>) {
        let accepted = match &entry {
            Entry::Error { .. } => {
                self.inner.fulfilled.store(true, Ordering::Release);
                true
            }
            _ => self
                .inner
                .fulfilled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        };
        if !accepted {
            log::debug!("promise already fulfilled, dropping entry");
            return;
        }
        *self.inner.entry.lock() = Some(entry.clone());
        self.inner.publisher.publish(entry);
    }

    /// Fulfil with a value.
    pub fn set(&self, value: V)
    where
        K: Default,
    {
        self.apply(Entry::Value {
            from: K::default(),
            value,
        });
    }

    /// Fulfil with (or override by) an error.
    pub fn error(&self, error: impl Into<Fault>)
    where
        K: Default,
    {
        self.apply(Entry::Error {
            from: K::default(),
            error: error.into(),
        });
    }

    /// Fulfil with a value tagged by an origin key.
    pub fn set_from(&self, from: K, value: V) {
        self.apply(Entry::Value { from, value });
    }

    /// Fulfil with (or override by) an error tagged by an origin key.
    pub fn error_from(&self, from: K, error: impl Into<Fault>) {
        self.apply(Entry::Error {
            from,
            error: error.into(),
        });
    }

    /// Peek the stored entry without blocking. Empty until fulfilled.
    pub fn get(&self) -> Option<Entry<K, V>> {
        self.inner.entry.lock().clone()
    }

    pub fn fulfilled(&self) -> bool {
        self.inner.fulfilled.load(Ordering::Acquire)
    }

    pub fn has_value_handler(&self) -> bool {
        self.inner.has_value_handler.load(Ordering::Acquire)
    }

    pub fn has_error_handler(&self) -> bool {
        self.inner.has_error_handler.load(Ordering::Acquire)
    }

    /// Name of the operation a listener is performing, for diagnostics.
    pub fn operation(&self) -> Option<String> {
        self.inner.operation.lock().clone()
    }

    pub fn set_operation(&self, name: impl Into<String>) {
        *self.inner.operation.lock() = Some(name.into());
    }

    /// Register a subscriber and, when the promise is already fulfilled,
    /// replay the stored entry to that subscriber synchronously.
    fn listen(&self, handler: ObserverFn<Entry<K, V>>) -> Subscription<Entry<K, V>> {
        let subscription = self.inner.publisher.subscribe_arc(Arc::clone(&handler));
        if let Some(entry) = self.get() {
            if let Err(error) = handler(entry) {
                log::error!("promise handler failed during replay: {error:#}");
            }
        }
        subscription
    }

    /// Run `value_fn` once the promise fulfils with a value.
    ///
    /// Returns a task that completes when `value_fn` ran, or fails when the
    /// promise failed or `value_fn` returned an error. A handler failure is
    /// also reinjected into this promise as an error entry so every other
    /// observer sees it. After an error the handler stays registered, so a
    /// later corrective error reaches the task as well.
    pub fn then<F>(&self, value_fn: F) -> Task
    where
        F: FnOnce(V) -> anyhow::Result<()> + Send + 'static,
    {
        let task = Task::new();
        let value_fn = Mutex::new(Some(value_fn));
        let slot: Arc<std::sync::OnceLock<Subscription<Entry<K, V>>>> =
            Arc::new(std::sync::OnceLock::new());
        let source = self.clone();
        let handler: ObserverFn<Entry<K, V>> = Arc::new({
            let task = task.clone();
            let slot = Arc::clone(&slot);
            move |entry| {
                match entry {
                    Entry::Value { from, value } => {
                        if let Some(value_fn) = value_fn.lock().take() {
                            if let Some(subscription) = slot.get() {
                                subscription.cancel();
                            }
                            match value_fn(value) {
                                Ok(()) => task.complete(),
                                Err(error) => {
                                    let fault =
                                        Fault::from(HandlerError::new("Promise.then", error));
                                    log::error!("{fault}");
                                    task.error(fault.clone());
                                    source.apply(Entry::Error { from, error: fault });
                                }
                            }
                        }
                    }
                    Entry::Error { error, .. } => task.error(error),
                    Entry::Finish { .. } | Entry::Close { .. } => {}
                }
                Ok(())
            }
        });
        let _ = slot.set(self.inner.publisher.subscribe_arc(Arc::clone(&handler)));
        self.inner.has_value_handler.store(true, Ordering::Release);
        if let Some(entry) = self.get() {
            let _ = handler(entry);
        }
        task
    }

    /// Run `error_fn` on the first error, removing the error from the chain.
    ///
    /// Returns a derived promise that receives this promise's value but not
    /// the handled error.
    pub fn on_error<F>(&self, error_fn: F) -> Promise<K, V>
    where
        F: FnOnce(K, Fault) + Send + 'static,
    {
        let filtered = Promise::new();
        let error_fn = Mutex::new(Some(error_fn));
        let slot: Arc<std::sync::OnceLock<Subscription<Entry<K, V>>>> =
            Arc::new(std::sync::OnceLock::new());
        let handler: ObserverFn<Entry<K, V>> = Arc::new({
            let filtered = filtered.clone();
            let slot = Arc::clone(&slot);
            move |entry| {
                match entry {
                    Entry::Error { from, error } => {
                        if let Some(error_fn) = error_fn.lock().take() {
                            if let Some(subscription) = slot.get() {
                                subscription.cancel();
                            }
                            error_fn(from, error);
                        }
                    }
                    other => filtered.apply(other),
                }
                Ok(())
            }
        });
        let _ = slot.set(self.inner.publisher.subscribe_arc(Arc::clone(&handler)));
        self.inner.has_error_handler.store(true, Ordering::Release);
        if let Some(entry) = self.get() {
            let _ = handler(entry);
        }
        filtered
    }

    /// Derive a promise holding the value transformed by `map_fn`.
    ///
    /// Errors propagate unchanged, including corrective errors after
    /// fulfilment.
    pub fn map<R, F>(&self, map_fn: F) -> Promise<K, R>
    where
        R: Clone + Send + 'static,
        F: Fn(V) -> R + Send + Sync + 'static,
    {
        let mapped = Promise::new();
        let handler: ObserverFn<Entry<K, V>> = Arc::new({
            let mapped = mapped.clone();
            move |entry| {
                match entry {
                    Entry::Value { from, value } => mapped.apply(Entry::Value {
                        from,
                        value: map_fn(value),
                    }),
                    Entry::Error { from, error } => mapped.apply(Entry::Error { from, error }),
                    Entry::Finish { from, level } => {
                        mapped.apply(Entry::Finish { from, level })
                    }
                    Entry::Close { from } => mapped.apply(Entry::Close { from }),
                }
                Ok(())
            }
        });
        let _ = self.listen(handler);
        self.inner.has_value_handler.store(true, Ordering::Release);
        mapped
    }

    /// Await the outcome from asynchronous code.
    ///
    /// Resolves with the first value or error delivered; fails when every
    /// handle to an unfulfilled promise is dropped.
    pub async fn result(&self) -> Result<V, Fault> {
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<V, Fault>>();
        let tx = Mutex::new(Some(tx));
        let handler: ObserverFn<Entry<K, V>> = Arc::new(move |entry| {
            let outcome = match entry {
                Entry::Value { value, .. } => Some(Ok(value)),
                Entry::Error { error, .. } => Some(Err(error)),
                Entry::Finish { .. } | Entry::Close { .. } => None,
            };
            if let Some(outcome) = outcome {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(outcome);
                }
            }
            Ok(())
        });
        let subscription = self.listen(handler);
        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(Fault::msg("promise dropped before fulfilment")));
        subscription.cancel();
        outcome
    }
}

impl<K, V> Promise<K, Promise<K, V>>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Flatten a promise of a promise into a promise of the inner result.
    ///
    /// The inner promise's value and errors forward to the returned promise;
    /// an error on the outer promise forwards directly.
    pub fn flatten(&self) -> Promise<K, V> {
        let flat = Promise::new();
        let handler: ObserverFn<Entry<K, Promise<K, V>>> = Arc::new({
            let flat = flat.clone();
            move |entry| {
                match entry {
                    Entry::Value { value: inner, .. } => {
                        let forward: ObserverFn<Entry<K, V>> = Arc::new({
                            let flat = flat.clone();
                            move |entry| {
                                flat.apply(entry);
                                Ok(())
                            }
                        });
                        let _ = inner.listen(forward);
                    }
                    Entry::Error { from, error } => flat.apply(Entry::Error { from, error }),
                    Entry::Finish { from, level } => flat.apply(Entry::Finish { from, level }),
                    Entry::Close { from } => flat.apply(Entry::Close { from }),
                }
                Ok(())
            }
        });
        let _ = self.listen(handler);
        self.inner.has_value_handler.store(true, Ordering::Release);
        flat
    }
}

impl<K, V> Default for Promise<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for Promise<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Promise {{ fulfilled: {}, entry: {:?} }}",
            self.inner.fulfilled.load(Ordering::Acquire),
            self.inner.entry.lock()
        )
    }
}

/// Run a future on the tokio runtime and expose its outcome as a promise.
pub fn spawn<V, Fut>(future: Fut) -> Promise<(), V>
where
    V: Clone + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<V>> + Send + 'static,
{
    let promise = Promise::new();
    let handle = promise.clone();
    tokio::spawn(async move {
        match future.await {
            Ok(value) => handle.set(value),
            Err(error) => handle.error(error),
        }
    });
    promise
}

/// Run a blocking closure off the async runtime and expose its outcome as a
/// promise.
pub fn spawn_blocking<V, F>(work: F) -> Promise<(), V>
where
    V: Clone + Send + 'static,
    F: FnOnce() -> anyhow::Result<V> + Send + 'static,
{
    let promise = Promise::new();
    let handle = promise.clone();
    tokio::task::spawn_blocking(move || match work() {
        Ok(value) => handle.set(value),
        Err(error) => handle.error(error),
    });
    promise
}
