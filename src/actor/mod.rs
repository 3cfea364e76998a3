//! Serialized mailbox actors.
//!
//! An [`Actor`] owns an unbounded FIFO inbox and a handler. `submit` enqueues
//! a message and returns immediately; internally at most one drain loop is
//! active per actor, so the handler never runs for two messages at once. The
//! handler receives a [`Done`] completion handle and the next message is not
//! popped until it is signalled, which lets a handler suspend across
//! asynchronous boundaries without blocking a worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

/// A serialized asynchronous message processor.
///
/// Cloning yields another handle to the same mailbox.
pub struct Actor<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Actor<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<M> {
    inbox: Mutex<VecDeque<M>>,
    draining: AtomicBool,
    act: Box<dyn Fn(M, Done) + Send + Sync>,
}

impl<M: Send + 'static> Actor<M> {
    /// Create an actor from a handler that signals completion explicitly.
    ///
    /// The handler may call [`Done::complete`] synchronously, or hand the
    /// handle to other code and complete later from any thread. Until it is
    /// completed the actor accepts further submissions but processes nothing.
    pub fn new<F>(act: F) -> Self
    where
        F: Fn(M, Done) + Send + Sync + 'static,
    {
        Actor {
            inner: Arc::new(Inner {
                inbox: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                act: Box::new(act),
            }),
        }
    }

    /// Create an actor whose handler finishes when it returns.
    pub fn new_sync<F>(act: F) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self::new(move |message, done| {
            act(message);
            done.complete();
        })
    }

    /// Enqueue a message. Never blocks, callable from any thread.
    pub fn submit(&self, message: M) {
        self.inner.inbox.lock().push_back(message);
        Inner::drain(&self.inner);
    }

    /// Number of messages waiting in the mailbox.
    pub fn pending(&self) -> usize {
        self.inner.inbox.lock().len()
    }
}

impl<M: Send + 'static> Inner<M> {
    fn drain(inner: &Arc<Inner<M>>) {
        if inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // a drain loop is already active and will see our message
            return;
        }
        Self::drain_owned(inner);
    }

    /// The drain loop. The caller must hold the drain token; the loop either
    /// releases it before returning or leaves it held on behalf of a handler
    /// that has not completed yet.
    fn drain_owned(inner: &Arc<Inner<M>>) {
        loop {
            let message = inner.inbox.lock().pop_front();
            let Some(message) = message else {
                // Release and re-check as one decision: a submit may have
                // enqueued between the failed pop and the release below.
                inner.draining.store(false, Ordering::Release);
                if inner.inbox.lock().is_empty() {
                    return;
                }
                if inner
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // the racing submitter took the token and drains for us
                    return;
                }
                continue;
            };

            let resume = {
                let inner = Arc::clone(inner);
                move || Inner::drain_owned(&inner)
            };
            let done = Done::new(resume);
            (inner.act)(message, done.clone());
            if done.suspend() {
                // handler still running asynchronously; its completion
                // resumes the loop with the token still held
                return;
            }
        }
    }
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const SUSPENDED: u8 = 2;
const RESUMED: u8 = 3;

/// Completion handle passed to an actor handler.
///
/// Exactly one call to [`complete`](Done::complete) finishes the current
/// message; duplicates are ignored. The handle is clonable and may be moved
/// to another thread.
#[derive(Clone)]
pub struct Done {
    state: Arc<DoneState>,
}

struct DoneState {
    phase: AtomicU8,
    resume: Box<dyn Fn() + Send + Sync>,
}

impl Done {
    fn new<F>(resume: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Done {
            state: Arc::new(DoneState {
                phase: AtomicU8::new(PENDING),
                resume: Box::new(resume),
            }),
        }
    }

    /// Signal that handling of the current message has finished.
    pub fn complete(&self) {
        match self.state.phase.compare_exchange(
            PENDING,
            COMPLETED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // synchronous completion: the drain loop is still on the stack
            Ok(_) => {}
            Err(SUSPENDED) => {
                if self
                    .state
                    .phase
                    .compare_exchange(SUSPENDED, RESUMED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    (self.state.resume)();
                }
            }
            // duplicate completion
            Err(_) => {}
        }
    }

    /// Called by the drain loop after the handler returned. True when the
    /// handler has not completed yet and the loop must yield.
    fn suspend(&self) -> bool {
        self.state
            .phase
            .compare_exchange(PENDING, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.state.phase.load(Ordering::Acquire) {
            PENDING => "pending",
            COMPLETED => "completed",
            SUSPENDED => "suspended",
            _ => "resumed",
        };
        write!(f, "Done {{ {phase} }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize};
    use std::time::{Duration, Instant};

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn greeter_handles_messages_in_order() {
        let greeted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&greeted);
        let greeter = Actor::new_sync(move |name: &str| {
            log.lock().push(format!("hello {name}"));
        });

        greeter.submit("world");
        greeter.submit("christian");
        greeter.submit("time to go");

        wait_for(|| greeted.lock().len() == 3);
        assert_eq!(
            greeted.lock().clone(),
            vec!["hello world", "hello christian", "hello time to go"]
        );
    }

    #[test]
    fn handlers_never_overlap_under_contention() {
        let _ = env_logger::builder().is_test(true).try_init();

        let access = Arc::new(AtomicI64::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));

        let actor = {
            let access = Arc::clone(&access);
            let violations = Arc::clone(&violations);
            let handled = Arc::clone(&handled);
            Actor::new_sync(move |_message: u32| {
                if access.fetch_add(1, Ordering::SeqCst) > 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                handled.fetch_add(1, Ordering::SeqCst);
                access.fetch_sub(1, Ordering::SeqCst);
            })
        };

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let actor = actor.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        actor.submit(i);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        wait_for(|| handled.load(Ordering::SeqCst) == 4000);
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(actor.pending(), 0);
    }

    #[test]
    fn asynchronous_completion_resumes_the_drain() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let actor = {
            let order = Arc::clone(&order);
            Actor::new(move |message: u32, done: Done| {
                order.lock().push(format!("start {message}"));
                let order = Arc::clone(&order);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    order.lock().push(format!("finish {message}"));
                    done.complete();
                });
            })
        };

        actor.submit(1);
        actor.submit(2);

        wait_for(|| order.lock().len() == 4);
        assert_eq!(
            order.lock().clone(),
            vec!["start 1", "finish 1", "start 2", "finish 2"]
        );
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let handled = Arc::new(AtomicUsize::new(0));
        let actor = {
            let handled = Arc::clone(&handled);
            Actor::new(move |_message: (), done: Done| {
                handled.fetch_add(1, Ordering::SeqCst);
                done.complete();
                done.complete();
            })
        };

        actor.submit(());
        actor.submit(());

        wait_for(|| handled.load(Ordering::SeqCst) == 2);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }
}
