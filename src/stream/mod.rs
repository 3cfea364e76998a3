//! Flow-controlled streams.
//!
//! A stream carries [`Entry`] values downstream and [`Command`] values
//! upstream. Delivery is pull-based: a value is only handed to the listener
//! once the consumer has requested it with [`next`](Stream::next); everything
//! else buffers. Entries and commands go through one serialized mailbox per
//! stream, so all state changes happen one at a time.
//!
//! Streams chain: a derived stream owns its own channel but shares the
//! chain's root as its input, so pushing into any stream of a chain inserts
//! at the root where backpressure is authoritative.

mod message;
mod observer;
mod source;

pub use message::{Command, Entry};
pub use observer::{StreamObserver, StreamResponder};
pub use source::{LoadBalancer, Splitter};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::actor::Actor;
use crate::config::StreamConfig;
use crate::error::Fault;

pub(crate) enum StreamMessage<K, V> {
    Entry(Entry<K, V>),
    Command(Command),
}

type EntryListener<K, V> = Arc<dyn Fn(Entry<K, V>) + Send + Sync>;
type CommandListener = Arc<dyn Fn(Command) + Send + Sync>;
type ClosedListener = Arc<dyn Fn() + Send + Sync>;

/// A push channel with pull-based flow control.
///
/// `Stream<K>` is a root stream whose values key themselves;
/// `Stream<K, V>` with a distinct `V` is a derived stream in a chain rooted
/// at a `Stream<K>`. Cloning yields another handle to the same channel.
pub struct Stream<K, V = K> {
    core: Arc<StreamCore<K, V>>,
    input: Arc<StreamCore<K, K>>,
}

impl<K, V> Clone for Stream<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            input: Arc::clone(&self.input),
        }
    }
}

impl<K> Stream<K, K>
where
    K: Clone + Send + 'static,
{
    /// Root a new chain.
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        let core = StreamCore::new(config);
        Stream {
            core: Arc::clone(&core),
            input: core,
        }
    }
}

impl<K> Default for Stream<K, K>
where
    K: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Stream<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Derive a stream that shares this chain's root as its input.
    ///
    /// The derived stream receives nothing by itself; whoever derives it is
    /// expected to feed it via [`apply`](Stream::apply) and wire its
    /// commands, the way the combinator layer and the splitters do.
    pub fn derive<W>(&self) -> Stream<K, W>
    where
        W: Clone + Send + 'static,
    {
        let config = StreamConfig {
            max_buffer: self.core.state.max_buffer,
        };
        Stream {
            core: StreamCore::new(config),
            input: Arc::clone(&self.input),
        }
    }

    /// The root of this chain.
    pub fn input(&self) -> Stream<K, K> {
        Stream {
            core: Arc::clone(&self.input),
            input: Arc::clone(&self.input),
        }
    }

    /// Drive an entry into this stream's channel.
    pub fn apply(&self, entry: Entry<K, V>) {
        self.core.actor.submit(StreamMessage::Entry(entry));
    }

    /// Queue a value on this channel for delivery to the listener.
    pub fn push(&self, from: K, value: V) {
        self.apply(Entry::Value { from, value });
    }

    /// Tell the stream an error occurred. The error is not thrown; it is
    /// passed along and can be listened for downstream.
    pub fn error(&self, from: K, error: impl Into<Fault>) {
        self.apply(Entry::Error {
            from,
            error: error.into(),
        });
    }

    /// Tell the stream a batch of the given level has finished.
    pub fn finish(&self, from: K, level: u32) {
        self.apply(Entry::Finish { from, level });
    }

    /// Push a value, keyed by itself, into the chain's root.
    pub fn emit(&self, value: K) {
        self.input.actor.submit(StreamMessage::Entry(Entry::Value {
            from: value.clone(),
            value,
        }));
    }

    /// Request one more value.
    pub fn next(&self) {
        self.core.actor.submit(StreamMessage::Command(Command::Next));
    }

    /// Discard values until the next batch boundary.
    pub fn skip(&self) {
        self.core.actor.submit(StreamMessage::Command(Command::Skip));
    }

    /// Close the stream. Terminal; further delivery is a no-op.
    pub fn close(&self) {
        self.core
            .actor
            .submit(StreamMessage::Command(Command::Close));
    }

    pub fn is_open(&self) -> bool {
        self.core.state.open.load(Ordering::Acquire)
    }

    /// Whether the consumer currently has outstanding demand.
    pub fn is_ready(&self) -> bool {
        self.core.state.ready.load(Ordering::Acquire)
    }

    pub fn is_skipping(&self) -> bool {
        self.core.state.skipping.load(Ordering::Acquire)
    }

    /// Number of buffered entries awaiting delivery.
    pub fn queued(&self) -> usize {
        self.core.state.queue.lock().len()
    }

    /// Attach the entry listener. At most one; a second call replaces it.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(Entry<K, V>) + Send + Sync + 'static,
    {
        *self.core.state.entry_listener.write() = Some(Arc::new(listener));
    }

    /// Attach the upstream command listener. At most one; replaced on a
    /// second call.
    pub fn on_command<F>(&self, listener: F)
    where
        F: Fn(Command) + Send + Sync + 'static,
    {
        *self.core.state.command_listener.write() = Some(Arc::new(listener));
    }

    /// Attach the closed listener.
    pub fn on_closed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.core.state.closed_listener.write() = Some(Arc::new(listener));
    }

    /// Bind an observer to this stream.
    ///
    /// Binding alone starts nothing: call [`next`](Stream::next) to issue the
    /// first demand.
    pub fn observe<O>(&self, observer: O)
    where
        O: StreamObserver<K, V> + 'static,
    {
        let observer = Arc::new(observer);
        let dispatch = Arc::clone(&observer);
        self.on_change(move |entry| match entry {
            Entry::Value { from, value } => dispatch.on_value(from, value),
            Entry::Error { from, error } => {
                if dispatch.on_error(from, error.clone()) {
                    panic!("stream error escalated by observer: {error}");
                }
            }
            Entry::Finish { from, level } => dispatch.on_finish(from, level),
            // the closed listener below reports this one
            Entry::Close { .. } => {}
        });
        self.on_closed(move || observer.on_closed());
    }
}

struct StreamCore<K, V> {
    actor: Actor<StreamMessage<K, V>>,
    state: Arc<StreamState<K, V>>,
}

impl<K, V> StreamCore<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn new(config: StreamConfig) -> Arc<Self> {
        let state = Arc::new(StreamState {
            queue: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            skipping: AtomicBool::new(false),
            entry_listener: RwLock::new(None),
            command_listener: RwLock::new(None),
            closed_listener: RwLock::new(None),
            max_buffer: config.max_buffer,
        });
        let processor = Arc::clone(&state);
        let actor = Actor::new(move |message, done| {
            processor.process(message);
            done.complete();
        });
        Arc::new(StreamCore { actor, state })
    }
}

struct StreamState<K, V> {
    queue: Mutex<VecDeque<Entry<K, V>>>,
    open: AtomicBool,
    ready: AtomicBool,
    skipping: AtomicBool,
    entry_listener: RwLock<Option<EntryListener<K, V>>>,
    command_listener: RwLock<Option<CommandListener>>,
    closed_listener: RwLock<Option<ClosedListener>>,
    max_buffer: usize,
}

impl<K, V> StreamState<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Runs inside the stream's mailbox, one message at a time.
    fn process(&self, message: StreamMessage<K, V>) {
        match message {
            StreamMessage::Entry(entry) => {
                if !self.open.load(Ordering::Acquire) {
                    return;
                }
                {
                    let mut queue = self.queue.lock();
                    if queue.len() >= self.max_buffer {
                        log::warn!(
                            "stream buffer full ({} entries), dropping incoming entry",
                            self.max_buffer
                        );
                        return;
                    }
                    queue.push_back(entry);
                }
                self.deliver_pending();
            }
            StreamMessage::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&self, command: Command) {
        match command {
            Command::Next => {
                if !self.open.load(Ordering::Acquire) {
                    return;
                }
                self.ready.store(true, Ordering::Release);
                if !self.deliver_pending() {
                    // demand not satisfiable locally, pull upstream
                    self.notify(Command::Next);
                }
            }
            Command::Skip => {
                if !self.open.load(Ordering::Acquire) {
                    return;
                }
                if self.skipping.swap(true, Ordering::AcqRel) {
                    return;
                }
                self.deliver_pending();
                if self.skipping.load(Ordering::Acquire) {
                    // no boundary buffered yet, skip upstream too
                    self.notify(Command::Skip);
                }
            }
            Command::Close => {
                if !self.open.swap(false, Ordering::AcqRel) {
                    return;
                }
                self.queue.lock().clear();
                log::debug!("stream closed by consumer");
                self.fire_closed();
                self.notify(Command::Close);
            }
        }
    }

    /// Deliver buffered entries until the head is a value without demand.
    /// Returns whether a value was delivered.
    fn deliver_pending(&self) -> bool {
        let mut delivered_value = false;
        loop {
            if !self.open.load(Ordering::Acquire) {
                return delivered_value;
            }
            let Some(listener) = self.entry_listener.read().clone() else {
                return delivered_value;
            };
            let entry = {
                let mut queue = self.queue.lock();
                if matches!(queue.front(), Some(Entry::Value { .. })) {
                    if self.skipping.load(Ordering::Acquire) {
                        queue.pop_front();
                        continue;
                    }
                    if !self.ready.load(Ordering::Acquire) {
                        return delivered_value;
                    }
                }
                match queue.pop_front() {
                    Some(entry) => entry,
                    None => return delivered_value,
                }
            };
            match entry {
                entry @ Entry::Value { .. } => {
                    self.ready.store(false, Ordering::Release);
                    delivered_value = true;
                    listener(entry);
                }
                entry @ Entry::Finish { .. } => {
                    self.skipping.store(false, Ordering::Release);
                    listener(entry);
                }
                entry @ Entry::Error { .. } => listener(entry),
                entry @ Entry::Close { .. } => {
                    self.open.store(false, Ordering::Release);
                    self.queue.lock().clear();
                    listener(entry);
                    self.fire_closed();
                    return delivered_value;
                }
            }
        }
    }

    fn notify(&self, command: Command) {
        if let Some(listener) = self.command_listener.read().clone() {
            listener(command);
        }
    }

    fn fire_closed(&self) {
        if let Some(listener) = self.closed_listener.read().clone() {
            listener();
        }
    }
}
