//! Idle detection.
//!
//! [`IdleStateHandler`] fires [`UserEvent::Idle`] when a channel has not
//! read, written, or done either for a configured time. Timers run on the
//! channel's executor and use its clock, so they follow the virtual clock of
//! an embedded channel in tests.

use crate::buffer::ByteBuffer;
use crate::channel::PipelineMessage;
use crate::error::{KeelsonError, Result};
use crate::executor::TimerHandle;
use crate::future::CompletionFuture;
use crate::pipeline::{ChannelHandler, HandlerContext, UserEvent};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

impl IdleState {
    const ALL: [Self; 3] = [Self::ReaderIdle, Self::WriterIdle, Self::AllIdle];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Fired as [`UserEvent::Idle`].
///
/// `first` is true for the first event of an idle period; it is set again
/// once the channel reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStateEvent {
    pub state: IdleState,
    pub first: bool,
}

struct Tracker<M: PipelineMessage> {
    timeouts: [Option<Duration>; 3],
    ctx: Option<HandlerContext<M>>,
    running: bool,
    reading: bool,
    last_read: Instant,
    last_write: Instant,
    first: [bool; 3],
    timers: [Option<TimerHandle>; 3],
}

type Shared<M> = Arc<Mutex<Tracker<M>>>;

/// Fires idle events for a channel.
///
/// A timeout of `None` disables that kind of check.
///
/// ```
/// use keelson_core::idle::IdleStateHandler;
/// use std::time::Duration;
///
/// let handler: IdleStateHandler = IdleStateHandler::new(Some(Duration::from_secs(30)), None, None)?;
/// # Ok::<(), keelson_core::error::KeelsonError>(())
/// ```
pub struct IdleStateHandler<M: PipelineMessage = ByteBuffer> {
    shared: Shared<M>,
}

impl<M: PipelineMessage> IdleStateHandler<M> {
    /// Zero durations are rejected; use `None` to disable a check.
    pub fn new(
        reader_idle: Option<Duration>,
        writer_idle: Option<Duration>,
        all_idle: Option<Duration>,
    ) -> Result<Self> {
        let timeouts = [reader_idle, writer_idle, all_idle];
        if timeouts.iter().flatten().any(Duration::is_zero) {
            return Err(KeelsonError::invalid_config("idle timeout must be non-zero"));
        }
        let now = Instant::now();
        Ok(Self {
            shared: Arc::new(Mutex::new(Tracker {
                timeouts,
                ctx: None,
                running: false,
                reading: false,
                last_read: now,
                last_write: now,
                first: [true; 3],
                timers: [None, None, None],
            })),
        })
    }

    #[must_use]
    pub fn timeout(&self, state: IdleState) -> Option<Duration> {
        self.shared.lock().timeouts[state.index()]
    }

    fn start(&self, ctx: &HandlerContext<M>) {
        let mut t = self.shared.lock();
        if t.running {
            return;
        }
        let now = ctx.executor().now();
        t.running = true;
        t.ctx = Some(ctx.clone());
        t.last_read = now;
        t.last_write = now;
        for state in IdleState::ALL {
            if let Some(timeout) = t.timeouts[state.index()] {
                arm(&mut t, &self.shared, state, timeout);
            }
        }
        trace!(handler = ctx.name(), "idle timers started");
    }

    fn stop(&self) {
        let mut t = self.shared.lock();
        t.running = false;
        t.ctx = None;
        for timer in t.timers.iter_mut().filter_map(Option::take) {
            timer.cancel();
        }
    }
}

fn arm<M: PipelineMessage>(t: &mut Tracker<M>, shared: &Shared<M>, state: IdleState, delay: Duration) {
    let Some(ctx) = &t.ctx else {
        return;
    };
    let weak = Arc::downgrade(shared);
    let handle = ctx.executor().schedule(
        delay,
        Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                on_timer(&shared, state);
            }
        }),
    );
    t.timers[state.index()] = Some(handle);
}

fn on_timer<M: PipelineMessage>(shared: &Shared<M>, state: IdleState) {
    let (ctx, event) = {
        let mut t = shared.lock();
        if !t.running {
            return;
        }
        let (Some(ctx), Some(timeout)) = (t.ctx.clone(), t.timeouts[state.index()]) else {
            return;
        };
        let last = match state {
            IdleState::ReaderIdle => t.last_read,
            IdleState::WriterIdle => t.last_write,
            IdleState::AllIdle => t.last_read.max(t.last_write),
        };
        let elapsed = ctx.executor().now().saturating_duration_since(last);

        // a read in progress is activity for the reader and all checks
        if t.reading && state != IdleState::WriterIdle {
            arm(&mut t, shared, state, timeout);
            return;
        }
        if elapsed < timeout {
            arm(&mut t, shared, state, timeout - elapsed);
            return;
        }
        arm(&mut t, shared, state, timeout);
        let first = std::mem::replace(&mut t.first[state.index()], false);
        (ctx, IdleStateEvent { state, first })
    };
    trace!(handler = ctx.name(), state = ?event.state, first = event.first, "idle");
    ctx.fire_user_event(UserEvent::Idle(event));
}

impl<M: PipelineMessage> ChannelHandler<M> for IdleStateHandler<M> {
    fn handler_added(&mut self, ctx: &HandlerContext<M>) {
        if ctx.channel().is_some_and(|c| c.is_active()) {
            self.start(ctx);
        }
    }

    fn handler_removed(&mut self, _ctx: &HandlerContext<M>) {
        self.stop();
    }

    fn channel_active(&mut self, ctx: &HandlerContext<M>) {
        self.start(ctx);
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext<M>) {
        self.stop();
        ctx.fire_channel_inactive();
    }

    fn channel_read(&mut self, ctx: &HandlerContext<M>, msg: M) {
        {
            let mut t = self.shared.lock();
            t.reading = true;
            t.first[IdleState::ReaderIdle.index()] = true;
            t.first[IdleState::AllIdle.index()] = true;
        }
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext<M>) {
        {
            let mut t = self.shared.lock();
            t.reading = false;
            t.last_read = ctx.executor().now();
        }
        ctx.fire_channel_read_complete();
    }

    fn write(&mut self, ctx: &HandlerContext<M>, msg: M, promise: CompletionFuture) {
        let weak = Arc::downgrade(&self.shared);
        let executor = Arc::clone(ctx.executor());
        promise.add_listener(move |done| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if done.is_success() {
                let mut t = shared.lock();
                t.last_write = executor.now();
                t.first[IdleState::WriterIdle.index()] = true;
                t.first[IdleState::AllIdle.index()] = true;
            }
        });
        ctx.write_with(msg, promise);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedChannel;

    fn idle_channel(
        reader: Option<Duration>,
        writer: Option<Duration>,
        all: Option<Duration>,
    ) -> EmbeddedChannel {
        let ch = EmbeddedChannel::new();
        ch.pipeline()
            .add_last("idle", IdleStateHandler::new(reader, writer, all).unwrap())
            .unwrap();
        ch
    }

    fn idle_event(ch: &EmbeddedChannel) -> Option<IdleStateEvent> {
        match ch.read_user_event()? {
            UserEvent::Idle(ev) => Some(ev),
            UserEvent::Custom(_) => None,
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let res: Result<IdleStateHandler> = IdleStateHandler::new(Some(Duration::ZERO), None, None);
        assert!(matches!(res, Err(KeelsonError::InvalidConfig(_))));
    }

    #[test]
    fn reader_idle_fires_once_per_period_with_first_flag() {
        let ch = idle_channel(Some(Duration::from_secs(5)), None, None);
        ch.advance_time(Duration::from_secs(4));
        assert!(idle_event(&ch).is_none());

        ch.advance_time(Duration::from_secs(1));
        assert_eq!(
            idle_event(&ch),
            Some(IdleStateEvent {
                state: IdleState::ReaderIdle,
                first: true
            })
        );

        ch.advance_time(Duration::from_secs(5));
        assert_eq!(
            idle_event(&ch),
            Some(IdleStateEvent {
                state: IdleState::ReaderIdle,
                first: false
            })
        );
    }

    #[test]
    fn reads_postpone_reader_idle_and_reset_first() {
        let ch = idle_channel(Some(Duration::from_secs(5)), None, None);
        ch.advance_time(Duration::from_secs(5));
        assert!(idle_event(&ch).unwrap().first);

        ch.advance_time(Duration::from_secs(3));
        ch.write_inbound(ByteBuffer::copied_from(b"ping"));
        assert!(ch.read_inbound().is_some());

        // next check at t=10 sees a read 2s ago and re-arms for t=13
        ch.advance_time(Duration::from_secs(2));
        assert!(idle_event(&ch).is_none());
        ch.advance_time(Duration::from_secs(3));
        let ev = idle_event(&ch).unwrap();
        assert_eq!(ev.state, IdleState::ReaderIdle);
        assert!(ev.first);
    }

    #[test]
    fn writer_idle_tracks_completed_writes() {
        let ch = idle_channel(None, Some(Duration::from_secs(2)), None);
        ch.advance_time(Duration::from_secs(1));
        assert!(ch.write_outbound(ByteBuffer::copied_from(b"x")).is_success());
        ch.advance_time(Duration::from_secs(1));
        assert!(idle_event(&ch).is_none());
        ch.advance_time(Duration::from_secs(2));
        assert_eq!(idle_event(&ch).map(|e| e.state), Some(IdleState::WriterIdle));
    }

    #[test]
    fn removal_cancels_timers() {
        let ch = idle_channel(Some(Duration::from_secs(1)), Some(Duration::from_secs(1)), None);
        assert_eq!(ch.executor().pending_timers(), 2);
        ch.pipeline().remove("idle").unwrap();
        assert_eq!(ch.executor().pending_timers(), 0);
        ch.advance_time(Duration::from_secs(10));
        assert!(ch.read_user_event().is_none());
    }

    #[test]
    fn close_stops_idle_events() {
        let ch = idle_channel(None, None, Some(Duration::from_secs(1)));
        assert!(ch.close().is_success());
        ch.advance_time(Duration::from_secs(5));
        assert!(ch.read_user_event().is_none());
    }
}
