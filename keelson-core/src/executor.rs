//! Executors: where channel work runs.
//!
//! Every channel is bound to one [`EventExecutor`] for its whole life. All
//! handler callbacks for the channel run on that executor's thread; requests
//! from other threads are posted with [`EventExecutor::execute`].
//!
//! Two implementations ship with the crate:
//! - [`EventLoop`](crate::event_loop::EventLoop): an OS thread running a compio
//!   runtime, used for real sockets.
//! - [`EmbeddedExecutor`]: a deterministic, single-threaded queue with a
//!   virtual clock, used by `EmbeddedChannel` and handler tests.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work posted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The event-loop abstraction channels are bound to.
pub trait EventExecutor: Send + Sync + 'static {
    /// True when called from the thread that runs this executor's tasks.
    fn in_event_loop(&self) -> bool;

    /// Queue `task` to run on the executor thread.
    fn execute(&self, task: Task);

    /// Run `task` once `delay` has elapsed, unless the handle is cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// The executor's clock. Timers and idle detection measure against it.
    fn now(&self) -> Instant;

    /// Run inline when already on the executor thread, otherwise post.
    fn run_or_post(&self, task: Task) {
        if self.in_event_loop() {
            task();
        } else {
            self.execute(task);
        }
    }
}

const TIMER_PENDING: u8 = 0;
const TIMER_FIRED: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

/// Cancellable handle for a scheduled task.
///
/// A timer leaves the pending state exactly once: either it fires or it is
/// cancelled. Cancelling never interrupts a task that is already running.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    deadline: Instant,
}

impl TimerHandle {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TIMER_PENDING)),
            deadline,
        }
    }

    /// Returns `true` if this call prevented the task from running.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(TIMER_PENDING, TIMER_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_CANCELLED
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_FIRED
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Claim the right to run the task. Only the first claim wins.
    pub(crate) fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(TIMER_PENDING, TIMER_FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct EmbeddedState {
    tasks: VecDeque<Task>,
    timers: BTreeMap<(Instant, u64), (TimerHandle, Task)>,
    now: Instant,
    seq: u64,
}

/// Deterministic executor for tests.
///
/// Tasks are queued and only run from [`run_pending`](Self::run_pending);
/// timers fire when [`advance_time`](Self::advance_time) moves the virtual
/// clock past their deadline. The calling thread always counts as the event
/// loop, so channel operations run inline.
pub struct EmbeddedExecutor {
    state: Mutex<EmbeddedState>,
}

impl EmbeddedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmbeddedState {
                tasks: VecDeque::new(),
                timers: BTreeMap::new(),
                now: Instant::now(),
                seq: 0,
            }),
        }
    }

    /// Run queued tasks and due timers until none are left. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                state.tasks.pop_front().or_else(|| Self::pop_due(&mut state))
            };
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Move the virtual clock forward, then run everything that became due.
    pub fn advance_time(&self, by: Duration) -> usize {
        self.state.lock().now += by;
        self.run_pending()
    }

    /// Number of queued tasks (timers excluded).
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Number of timers that are neither fired nor cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .values()
            .filter(|(handle, _)| !handle.is_cancelled())
            .count()
    }

    fn pop_due(state: &mut EmbeddedState) -> Option<Task> {
        loop {
            let key = *state.timers.keys().next()?;
            if key.0 > state.now {
                return None;
            }
            let (handle, task) = state.timers.remove(&key)?;
            if handle.try_fire() {
                return Some(task);
            }
        }
    }
}

impl Default for EmbeddedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExecutor for EmbeddedExecutor {
    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Task) {
        self.state.lock().tasks.push_back(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        let handle = TimerHandle::new(deadline);
        state.seq += 1;
        let key = (deadline, state.seq);
        state.timers.insert(key, (handle.clone(), task));
        handle
    }

    fn now(&self) -> Instant {
        self.state.lock().now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_post_order() {
        let exec = EmbeddedExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            exec.execute(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(exec.pending_tasks(), 3);
        assert_eq!(exec.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn tasks_posted_while_running_also_run() {
        let exec = Arc::new(EmbeddedExecutor::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (e, h) = (exec.clone(), hits.clone());
        exec.execute(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            let h = h.clone();
            e.execute(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        exec.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timers_follow_virtual_clock() {
        let exec = EmbeddedExecutor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = exec.schedule(
            Duration::from_secs(5),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        exec.advance_time(Duration::from_secs(4));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        exec.advance_time(Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timer.is_fired());
        assert!(!timer.cancel());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let exec = EmbeddedExecutor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = exec.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(exec.pending_timers(), 1);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        exec.advance_time(Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(exec.pending_timers(), 0);
    }
}
