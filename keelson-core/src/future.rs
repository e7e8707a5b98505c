//! Completion futures.
//!
//! A [`CompletionFuture`] is the observable outcome of an asynchronous channel
//! operation. It is resolved at most once (success, failure or cancellation)
//! by whoever performs the operation, usually the channel's event loop, and
//! can be observed from any thread:
//!
//! - listeners run in registration order on the resolving thread, or
//!   immediately on the registering thread if the future is already done;
//! - `wait`/`wait_timeout` block a non-loop thread on a condition variable
//!   that is only created once someone actually blocks;
//! - `listen()` bridges into `async` code.
//!
//! Blocking on a pending future from the event loop that must resolve it would
//! stall that loop forever. Futures that know their executor refuse such waits
//! with [`KeelsonError::BlockingInEventLoop`]; see [`set_deadlock_check`].

use crate::error::{KeelsonError, Result};
use crate::executor::EventExecutor;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

static DEADLOCK_CHECK: AtomicBool = AtomicBool::new(true);

/// Enable or disable the blocking-wait dead-lock check process-wide.
///
/// Disabling it lets advanced callers block on a loop thread when they know
/// another thread resolves the future.
pub fn set_deadlock_check(enabled: bool) {
    DEADLOCK_CHECK.store(enabled, Ordering::Release);
}

#[must_use]
pub fn deadlock_check_enabled() -> bool {
    DEADLOCK_CHECK.load(Ordering::Acquire)
}

type Listener<T> = Box<dyn FnOnce(&CompletionFuture<T>) + Send + 'static>;

enum Outcome<T> {
    Success(T),
    Failure(Arc<KeelsonError>),
    Cancelled,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    listeners: SmallVec<[Listener<T>; 2]>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: OnceCell<Condvar>,
    executor: Option<Arc<dyn EventExecutor>>,
}

/// Resolve-once outcome of an asynchronous operation.
///
/// Cloning yields another handle to the same future.
pub struct CompletionFuture<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> CompletionFuture<T> {
    /// A pending future with no owning executor (no dead-lock check).
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A pending future resolved by `executor`.
    #[must_use]
    pub fn with_executor(executor: Arc<dyn EventExecutor>) -> Self {
        Self::build(Some(executor))
    }

    #[must_use]
    pub fn succeeded(value: T) -> Self {
        let f = Self::new();
        f.set_success(value);
        f
    }

    #[must_use]
    pub fn failed(err: KeelsonError) -> Self {
        let f = Self::new();
        f.set_failure(err);
        f
    }

    fn build(executor: Option<Arc<dyn EventExecutor>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: SmallVec::new(),
                }),
                cond: OnceCell::new(),
                executor,
            }),
        }
    }

    /// The executor this future was created for, if any.
    #[must_use]
    pub fn executor(&self) -> Option<&Arc<dyn EventExecutor>> {
        self.inner.executor.as_ref()
    }

    pub fn set_success(&self, value: T) -> bool {
        self.resolve(Outcome::Success(value))
    }

    pub fn set_failure(&self, err: KeelsonError) -> bool {
        self.resolve(Outcome::Failure(Arc::new(err)))
    }

    /// Fail with a cause that other futures already carry.
    pub fn set_shared_failure(&self, err: Arc<KeelsonError>) -> bool {
        self.resolve(Outcome::Failure(err))
    }

    /// Best-effort cancellation. Does not interrupt in-flight I/O.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.listeners)
        };
        // Waiters create the condvar under the lock before sleeping, so a
        // waiter that missed the outcome is guaranteed to be visible here.
        if let Some(cond) = self.inner.cond.get() {
            cond.notify_all();
        }
        for listener in listeners {
            self.notify(listener);
        }
        true
    }

    fn notify(&self, listener: Listener<T>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(self))) {
            let err = KeelsonError::ListenerPanicked(panic_message(payload.as_ref()));
            error!(error = %err, "completion listener failed");
        }
    }

    /// Register `listener`. Runs immediately on this thread if already done.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.listeners.push(Box::new(listener));
            return;
        }
        drop(state);
        self.notify(Box::new(listener));
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Success(_)))
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Failure(_)))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Cancelled))
    }

    /// The failure cause, if the future failed.
    #[must_use]
    pub fn cause(&self) -> Option<Arc<KeelsonError>> {
        match &self.inner.state.lock().outcome {
            Some(Outcome::Failure(err)) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    fn check_deadlock(&self) -> Result<()> {
        if !deadlock_check_enabled() {
            return Ok(());
        }
        if let Some(executor) = &self.inner.executor {
            if executor.in_event_loop() && !self.is_done() {
                return Err(KeelsonError::BlockingInEventLoop);
            }
        }
        Ok(())
    }

    /// Block until resolved.
    pub fn wait(&self) -> Result<()> {
        self.check_deadlock()?;
        let mut state = self.inner.state.lock();
        let cond = self.inner.cond.get_or_init(Condvar::new);
        while state.outcome.is_none() {
            cond.wait(&mut state);
        }
        Ok(())
    }

    /// Block until resolved or `timeout` elapses. Returns whether it resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.check_deadlock()?;
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        let cond = self.inner.cond.get_or_init(Condvar::new);
        while state.outcome.is_none() {
            if cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.outcome.is_some());
            }
        }
        Ok(true)
    }
}

impl<T: Clone + Send + 'static> CompletionFuture<T> {
    /// The success value, if resolved successfully.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        match &self.inner.state.lock().outcome {
            Some(Outcome::Success(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The outcome as a `Result`, or `None` while pending.
    #[must_use]
    pub fn result(&self) -> Option<Result<T>> {
        self.inner.state.lock().outcome.as_ref().map(|outcome| match outcome {
            Outcome::Success(v) => Ok(v.clone()),
            Outcome::Failure(err) => Err(KeelsonError::Failed(Arc::clone(err))),
            Outcome::Cancelled => Err(KeelsonError::Cancelled),
        })
    }

    /// Block until resolved and return the outcome.
    pub fn get(&self) -> Result<T> {
        self.wait()?;
        self.result().unwrap_or(Err(KeelsonError::Cancelled))
    }

    /// Resolve `other` the same way once this future resolves.
    pub fn cascade_to(&self, other: &Self) {
        let other = other.clone();
        self.add_listener(move |done| match &done.inner.state.lock().outcome {
            Some(Outcome::Success(v)) => {
                other.set_success(v.clone());
            }
            Some(Outcome::Failure(err)) => {
                other.set_shared_failure(Arc::clone(err));
            }
            Some(Outcome::Cancelled) | None => {
                other.cancel();
            }
        });
    }

    /// Await the outcome from async code without blocking a thread.
    pub fn listen(&self) -> impl std::future::Future<Output = Result<T>> + Send + 'static {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.add_listener(move |done| {
            let _ = tx.send(done.result().unwrap_or(Err(KeelsonError::Cancelled)));
        });
        async move { rx.await.unwrap_or(Err(KeelsonError::Cancelled)) }
    }
}

impl<T: Send + 'static> Default for CompletionFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.state.lock().outcome {
            None => "pending".to_string(),
            Some(Outcome::Success(_)) => "success".to_string(),
            Some(Outcome::Failure(err)) => format!("failure({err})"),
            Some(Outcome::Cancelled) => "cancelled".to_string(),
        };
        write!(f, "CompletionFuture({state})")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EmbeddedExecutor;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn resolves_at_most_once() {
        let f: CompletionFuture<u32> = CompletionFuture::new();
        assert!(f.set_success(1));
        assert!(!f.set_success(2));
        assert!(!f.set_failure(KeelsonError::ChannelClosed));
        assert!(!f.cancel());
        assert_eq!(f.value(), Some(1));
        assert!(f.is_success());

        let g: CompletionFuture = CompletionFuture::new();
        assert!(g.cancel());
        assert!(!g.cancel());
        assert!(!g.set_success(()));
        assert!(g.is_cancelled());
        assert!(matches!(g.get(), Err(KeelsonError::Cancelled)));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let f: CompletionFuture = CompletionFuture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            f.add_listener(move |_| order.lock().push(i));
        }
        assert!(order.lock().is_empty());
        f.set_success(());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn late_listener_runs_once_synchronously() {
        let f: CompletionFuture = CompletionFuture::succeeded(());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        f.add_listener(move |done| {
            assert!(done.is_success());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        f.set_success(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let f: CompletionFuture = CompletionFuture::new();
        let hits = Arc::new(AtomicUsize::new(0));
        f.add_listener(|_| panic!("listener bug"));
        let h = hits.clone();
        f.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(f.set_success(()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_is_shared_between_observers() {
        let f: CompletionFuture = CompletionFuture::failed(KeelsonError::ChannelClosed);
        let a = f.cause().unwrap();
        let b = f.cause().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        match f.get() {
            Err(KeelsonError::Failed(inner)) => assert!(matches!(*inner, KeelsonError::ChannelClosed)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wait_returns_once_resolved_elsewhere() {
        let f: CompletionFuture<&'static str> = CompletionFuture::new();
        let resolver = f.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.set_success("done");
        });
        assert_eq!(f.get().unwrap(), "done");
        t.join().unwrap();
        // already resolved: returns immediately
        f.wait().unwrap();
        assert!(f.wait_timeout(Duration::ZERO).unwrap());
    }

    #[test]
    fn wait_timeout_expires_on_pending_future() {
        let f: CompletionFuture = CompletionFuture::new();
        assert!(!f.wait_timeout(Duration::from_millis(10)).unwrap());
        assert!(!f.is_done());
    }

    #[test]
    fn blocking_on_own_loop_is_refused() {
        let exec: Arc<dyn EventExecutor> = Arc::new(EmbeddedExecutor::new());
        let f: CompletionFuture = CompletionFuture::with_executor(exec);
        assert!(matches!(f.wait(), Err(KeelsonError::BlockingInEventLoop)));
        assert!(matches!(
            f.wait_timeout(Duration::from_millis(1)),
            Err(KeelsonError::BlockingInEventLoop)
        ));
        // a resolved future never blocks, so the check does not apply
        f.set_success(());
        f.wait().unwrap();
    }

    #[test]
    fn cascade_copies_outcome() {
        let src: CompletionFuture<u8> = CompletionFuture::new();
        let dst: CompletionFuture<u8> = CompletionFuture::new();
        src.cascade_to(&dst);
        src.set_success(9);
        assert_eq!(dst.value(), Some(9));
    }

    #[test]
    fn listen_bridges_to_async() {
        let f: CompletionFuture<u64> = CompletionFuture::new();
        let fut = f.listen();
        let resolver = f.clone();
        let t = thread::spawn(move || resolver.set_success(42));
        assert_eq!(futures::executor::block_on(fut).unwrap(), 42);
        t.join().unwrap();
    }
}
