//! Event loops backed by compio runtimes.
//!
//! One [`EventLoop`] is one OS thread running a single-threaded compio runtime
//! (io_uring on Linux). Tasks are posted through an unbounded flume queue and
//! run in arrival order; socket pumps are spawned onto the same runtime, so a
//! channel's I/O and all of its handler callbacks share one thread.

use crate::error::{KeelsonError, Result};
use crate::executor::{EventExecutor, Task, TimerHandle};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<usize> = const { Cell::new(0) };
}

enum LoopCmd {
    Run(Task),
    Shutdown,
}

struct LoopInner {
    id: usize,
    name: String,
    tx: Sender<LoopCmd>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl LoopInner {
    fn on_loop_thread(&self) -> bool {
        CURRENT_LOOP.with(|c| c.get() == self.id)
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(LoopCmd::Shutdown);
        // The loop thread cannot join itself; it exits after this task.
        if self.on_loop_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(event_loop = %self.name, "event loop thread panicked");
            }
        }
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to an event loop thread. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Start a loop thread named `name`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || loop_thread(id, &thread_name, rx))
            .map_err(KeelsonError::Io)?;
        Ok(Self {
            inner: Arc::new(LoopInner {
                id,
                name,
                tx,
                thread: Mutex::new(Some(handle)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// This loop as a shareable executor for channels.
    #[must_use]
    pub fn executor(&self) -> Arc<dyn EventExecutor> {
        Arc::new(self.clone())
    }

    /// Run a `Send` future on the loop.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.execute(Box::new(move || spawn_local(fut)));
    }

    /// Stop the loop and join its thread. Idempotent.
    ///
    /// Tasks already queued ahead of the stop request still run; tasks
    /// posted afterwards are dropped with a warning.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl EventExecutor for EventLoop {
    fn in_event_loop(&self) -> bool {
        self.inner.on_loop_thread()
    }

    fn execute(&self, task: Task) {
        if self.inner.tx.send(LoopCmd::Run(task)).is_err() {
            warn!(event_loop = %self.inner.name, "event loop stopped, task dropped");
        }
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new(Instant::now() + delay);
        let timer = handle.clone();
        // the sleep future is !Send, so it is created on the loop thread
        self.execute(Box::new(move || {
            spawn_local(async move {
                compio::time::sleep(delay).await;
                if timer.try_fire() {
                    task();
                }
            });
        }));
        handle
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Spawn a `!Send` future on the current loop thread's runtime.
///
/// Must be called from an event loop thread (inside a posted task or an
/// already running future).
pub fn spawn_local<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    compio::runtime::spawn(fut).detach();
}

/// True when the calling thread is any keelson event loop.
#[must_use]
pub fn on_event_loop() -> bool {
    CURRENT_LOOP.with(|c| c.get() != 0)
}

fn loop_thread(id: usize, name: &str, rx: Receiver<LoopCmd>) {
    CURRENT_LOOP.with(|c| c.set(id));
    debug!(event_loop = %name, "starting");

    let rt = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(event_loop = %name, error = %e, "failed to create runtime");
            return;
        }
    };

    rt.block_on(async move {
        while let Ok(cmd) = rx.recv_async().await {
            match cmd {
                LoopCmd::Run(task) => {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(event_loop = %name, "task panicked");
                    }
                }
                LoopCmd::Shutdown => break,
            }
        }
    });

    debug!(event_loop = %name, "stopped");
}

/// A fixed set of event loops handed out round-robin.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// One loop per CPU core.
    pub fn new() -> Result<Self> {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        debug!(threads, "starting event loop group");
        let loops = (0..threads)
            .map(|i| EventLoop::new(format!("keelson-loop-{i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The next loop in round-robin order.
    #[must_use]
    pub fn next(&self) -> EventLoop {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn shutdown(&self) {
        for l in &self.loops {
            l.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_on_loop_thread() {
        let el = EventLoop::new("test-loop").unwrap();
        assert!(!el.in_event_loop());
        let (tx, rx) = mpsc::channel();
        let same = el.clone();
        el.execute(Box::new(move || {
            tx.send((same.in_event_loop(), on_event_loop())).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, true));
        el.shutdown();
        assert!(el.is_shut_down());
    }

    #[test]
    fn scheduled_task_fires_unless_cancelled() {
        let el = EventLoop::new("timer-loop").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let cancelled = el.schedule(
            Duration::from_millis(30),
            Box::new(move || tx2.send("cancelled").unwrap()),
        );
        el.schedule(Duration::from_millis(10), Box::new(move || tx.send("fired").unwrap()));
        assert!(cancelled.cancel());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        el.shutdown();
    }

    #[test]
    fn timers_can_be_armed_from_the_loop_thread() {
        let el = EventLoop::new("timer-rearm").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = el.clone();
        el.execute(Box::new(move || {
            let again = inner.clone();
            inner.schedule(
                Duration::from_millis(5),
                Box::new(move || {
                    tx.send(again.in_event_loop()).unwrap();
                }),
            );
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        el.shutdown();
    }

    #[test]
    fn group_hands_out_round_robin() {
        let group = EventLoopGroup::with_threads(2).unwrap();
        let a = group.next();
        let b = group.next();
        let c = group.next();
        assert_eq!(group.len(), 2);
        assert_ne!(a.name(), b.name());
        assert_eq!(a.name(), c.name());
        group.shutdown();
    }
}
