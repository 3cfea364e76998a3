//! Fanning one source stream out to several child streams.
//!
//! A splitter attaches to exactly one source stream and owns the streams
//! piped to it. Source entries are dispatched to the children by the
//! splitter's policy; child commands are aggregated back into a single
//! coherent demand signal on the shared source: any child's `Next` justifies
//! pulling one more item, while `Skip` and `Close` only travel upstream once
//! every child agrees.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::message::{Command, Entry};
use super::Stream;

struct SplitterBase<K, V> {
    source: Stream<K, V>,
    children: RwLock<Vec<Stream<K, V>>>,
}

impl<K, V> SplitterBase<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn new(source: Stream<K, V>) -> Arc<Self> {
        Arc::new(SplitterBase {
            source,
            children: RwLock::new(Vec::new()),
        })
    }

    fn children(&self) -> Vec<Stream<K, V>> {
        self.children.read().clone()
    }

    fn add(&self, child: &Stream<K, V>) {
        self.children.write().push(child.clone());
    }

    /// Default command aggregation for one child command.
    fn aggregate(&self, command: Command) {
        match command {
            Command::Next => self.source.next(),
            Command::Skip => {
                // skipping the shared source while one child still wants
                // real data would starve that child
                if self.children().iter().all(|child| child.is_skipping()) {
                    self.source.skip();
                }
            }
            Command::Close => {
                if self.children().iter().all(|child| !child.is_open()) {
                    self.source.close();
                }
            }
        }
    }
}

/// Copies every entry of the source to every attached stream.
pub struct Splitter<K, V> {
    base: Arc<SplitterBase<K, V>>,
}

impl<K, V> Splitter<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(source: Stream<K, V>) -> Self {
        let base = SplitterBase::new(source);
        let dispatch = Arc::clone(&base);
        base.source.on_change(move |entry| {
            for child in dispatch.children() {
                child.apply(entry.clone());
            }
        });
        Splitter { base }
    }

    /// Derive, attach and return a new child stream.
    pub fn stream(&self) -> Stream<K, V> {
        let child = self.base.source.derive();
        self.pipe(&child);
        child
    }

    /// Derive `count` child streams at once.
    pub fn fan_out(&self, count: usize) -> Vec<Stream<K, V>> {
        (0..count).map(|_| self.stream()).collect()
    }

    /// Attach an existing stream as a child.
    pub fn pipe(&self, child: &Stream<K, V>) {
        let base = Arc::clone(&self.base);
        child.on_command(move |command| base.aggregate(command));
        self.base.add(child);
    }

    pub fn source(&self) -> &Stream<K, V> {
        &self.base.source
    }

    pub fn children(&self) -> Vec<Stream<K, V>> {
        self.base.children()
    }
}

/// Routes each value of the source to the first attached stream that is
/// ready, so each child receives different values. Errors and batch
/// boundaries are global and go to every child regardless of readiness.
///
/// A value arriving while no child is ready is held and re-dispatched on the
/// next child demand.
pub struct LoadBalancer<K, V> {
    base: Arc<SplitterBase<K, V>>,
    held: Arc<Mutex<VecDeque<Entry<K, V>>>>,
}

impl<K, V> LoadBalancer<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(source: Stream<K, V>) -> Self {
        let base = SplitterBase::new(source);
        let held: Arc<Mutex<VecDeque<Entry<K, V>>>> = Arc::new(Mutex::new(VecDeque::new()));

        let dispatch = Arc::clone(&base);
        let hold = Arc::clone(&held);
        base.source.on_change(move |entry| match entry {
            entry @ Entry::Value { .. } => {
                let target = dispatch
                    .children()
                    .into_iter()
                    .find(|child| child.is_ready());
                match target {
                    Some(child) => child.apply(entry),
                    None => {
                        log::debug!("no balanced stream ready, holding value");
                        hold.lock().push_back(entry);
                    }
                }
            }
            global => {
                for child in dispatch.children() {
                    child.apply(global.clone());
                }
            }
        });

        LoadBalancer { base, held }
    }

    /// Derive, attach and return a new child stream.
    pub fn stream(&self) -> Stream<K, V> {
        let child = self.base.source.derive();
        self.pipe(&child);
        child
    }

    /// Derive `count` child streams at once.
    pub fn fan_out(&self, count: usize) -> Vec<Stream<K, V>> {
        (0..count).map(|_| self.stream()).collect()
    }

    /// Attach an existing stream as a child.
    pub fn pipe(&self, child: &Stream<K, V>) {
        let base = Arc::clone(&self.base);
        let held = Arc::clone(&self.held);
        child.on_command(move |command| match command {
            Command::Next => {
                // satisfy the demand from held values before pulling the
                // shared source
                let mut delivered = false;
                loop {
                    let entry = held.lock().pop_front();
                    let Some(entry) = entry else { break };
                    let target = base.children().into_iter().find(|child| child.is_ready());
                    match target {
                        Some(child) => {
                            child.apply(entry);
                            delivered = true;
                        }
                        None => {
                            held.lock().push_front(entry);
                            break;
                        }
                    }
                }
                if !delivered {
                    base.source.next();
                }
            }
            other => base.aggregate(other),
        });
        self.base.add(child);
    }

    pub fn source(&self) -> &Stream<K, V> {
        &self.base.source
    }

    pub fn children(&self) -> Vec<Stream<K, V>> {
        self.base.children()
    }

    /// Number of values currently held because no child was ready.
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting<K, V>(stream: &Stream<K, V>) -> Arc<Mutex<Vec<V>>>
    where
        K: Clone + Send + 'static,
        V: Clone + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        stream.on_change(move |entry| {
            if let Entry::Value { value, .. } = entry {
                sink.lock().push(value);
            }
        });
        seen
    }

    #[test]
    fn balancer_routes_to_the_first_ready_child() {
        let source: Stream<String> = Stream::new();
        let balancer = LoadBalancer::new(source.clone());
        let children = balancer.fan_out(3);

        let seen: Vec<_> = children.iter().map(collecting).collect();
        children[1].next();

        source.emit("x".to_string());

        assert!(seen[0].lock().is_empty());
        assert_eq!(seen[1].lock().clone(), vec!["x".to_string()]);
        assert!(seen[2].lock().is_empty());
    }

    #[test]
    fn balancer_broadcasts_errors_and_finishes() {
        let source: Stream<i32> = Stream::new();
        let balancer = LoadBalancer::new(source.clone());
        let children = balancer.fan_out(3);

        let finishes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        for child in &children {
            let finishes = Arc::clone(&finishes);
            let errors = Arc::clone(&errors);
            child.on_change(move |entry| match entry {
                Entry::Finish { .. } => {
                    finishes.fetch_add(1, Ordering::SeqCst);
                }
                Entry::Error { .. } => {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            });
        }

        // no child has demand; global signals go everywhere anyway
        source.finish(0, 0);
        source.error(0, crate::error::Fault::msg("broken"));

        assert_eq!(finishes.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn skip_travels_upstream_only_when_every_child_skips() {
        let source: Stream<i32> = Stream::new();
        let upstream_skips = Arc::new(AtomicUsize::new(0));
        {
            let upstream_skips = Arc::clone(&upstream_skips);
            source.on_command(move |command| {
                if command == Command::Skip {
                    upstream_skips.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let balancer = LoadBalancer::new(source.clone());
        let children = balancer.fan_out(3);
        for child in &children {
            child.on_change(|_entry| {});
        }

        children[0].skip();
        assert!(!source.is_skipping());
        children[1].skip();
        assert!(!source.is_skipping());
        children[2].skip();
        assert!(source.is_skipping());
        assert_eq!(upstream_skips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_travels_upstream_only_when_every_child_closed() {
        let source: Stream<i32> = Stream::new();
        let balancer = LoadBalancer::new(source.clone());
        let children = balancer.fan_out(2);

        children[0].close();
        assert!(source.is_open());
        children[1].close();
        assert!(!source.is_open());
    }

    #[test]
    fn held_values_are_redispatched_on_demand() {
        let source: Stream<i32> = Stream::new();
        let balancer = LoadBalancer::new(source.clone());
        let children = balancer.fan_out(2);
        let seen: Vec<_> = children.iter().map(collecting).collect();

        // demand on the source without any ready child
        source.next();
        source.emit(5);
        assert_eq!(balancer.held(), 1);
        assert!(seen[0].lock().is_empty());

        children[0].next();
        assert_eq!(balancer.held(), 0);
        assert_eq!(seen[0].lock().clone(), vec![5]);
        assert!(seen[1].lock().is_empty());
    }

    #[test]
    fn splitter_copies_values_to_every_child() {
        let source: Stream<i32> = Stream::new();
        let splitter = Splitter::new(source.clone());
        let children = splitter.fan_out(2);
        let seen: Vec<_> = children.iter().map(collecting).collect();

        for child in &children {
            child.next();
        }
        source.emit(3);

        assert_eq!(seen[0].lock().clone(), vec![3]);
        assert_eq!(seen[1].lock().clone(), vec![3]);
    }

    #[test]
    fn child_demand_pulls_the_shared_source() {
        let source: Stream<i32> = Stream::new();
        let balancer = LoadBalancer::new(source.clone());
        let child = balancer.stream();
        child.on_change(|_entry| {});

        assert!(!source.is_ready());
        child.next();
        assert!(source.is_ready());
    }
}
