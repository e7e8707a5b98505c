//! Handler pipelines.
//!
//! A pipeline is an ordered list of named handlers between the channel's
//! transport (head) and the application (tail). Inbound events enter at the
//! head and travel toward the tail; outbound requests enter at the tail and
//! travel toward the head, where the channel hands them to its transport:
//!
//! ```text
//!            inbound ──►
//!  head ─ [decoder] ─ [encoder] ─ [app] ─ tail
//!            ◄── outbound
//! ```
//!
//! Every handler call happens on the channel's executor. Calls arriving from
//! other threads are posted there first. A handler is never re-entered: an
//! event for a handler that is still inside a callback (for example an echo
//! write travelling back through the decoder that produced the message) is
//! queued on the executor and delivered once the callback returns.

mod context;
mod handler;

pub use context::HandlerContext;
pub use handler::{ChannelHandler, UserEvent};

use crate::buffer::ByteBuffer;
use crate::channel::{Channel, ChannelId, ChannelInner, PipelineMessage};
use crate::error::{KeelsonError, Result};
use crate::executor::EventExecutor;
use crate::future::CompletionFuture;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum Inbound<M: PipelineMessage> {
    Created,
    Active,
    Inactive,
    Read(M),
    ReadComplete,
    Exception(Arc<KeelsonError>),
    User(UserEvent),
    Child(Channel<M>),
}

pub(crate) enum Outbound<M> {
    Bind(SocketAddr, CompletionFuture),
    Connect(SocketAddr, CompletionFuture),
    Disconnect(CompletionFuture),
    Close(CompletionFuture),
    Write(M, CompletionFuture),
    Flush,
}

impl<M> Outbound<M> {
    /// Fail the request's promise: its channel is gone.
    pub(crate) fn fail_closed(self) {
        match self {
            Self::Bind(_, p)
            | Self::Connect(_, p)
            | Self::Disconnect(p)
            | Self::Close(p)
            | Self::Write(_, p) => {
                p.set_failure(KeelsonError::ChannelClosed);
            }
            Self::Flush => {}
        }
    }
}

/// Where an event currently is in the pipeline.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Cursor {
    Head,
    /// At a handler. `detached_at` is set for a handler that has just been
    /// removed, so it can still pass events on from its old position.
    At { id: u64, detached_at: Option<usize> },
    Tail,
}

struct Entry<M: PipelineMessage> {
    id: u64,
    name: Arc<str>,
    handler: Mutex<Box<dyn ChannelHandler<M>>>,
}

enum Position {
    First,
    Last,
    Before(Arc<str>),
    After(Arc<str>),
}

/// Inbound traffic that reached the tail, kept for test harnesses instead of
/// being dropped.
pub(crate) struct TailSink<M> {
    pub(crate) messages: Mutex<VecDeque<M>>,
    pub(crate) exceptions: Mutex<VecDeque<Arc<KeelsonError>>>,
    pub(crate) user_events: Mutex<VecDeque<UserEvent>>,
}

impl<M> TailSink<M> {
    pub(crate) fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            exceptions: Mutex::new(VecDeque::new()),
            user_events: Mutex::new(VecDeque::new()),
        }
    }
}

struct DispatchGuard<'a>(&'a AtomicUsize);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Ordered handler chain of one channel.
pub struct Pipeline<M: PipelineMessage = ByteBuffer> {
    channel: Weak<ChannelInner<M>>,
    executor: Arc<dyn EventExecutor>,
    entries: RwLock<Vec<Arc<Entry<M>>>>,
    depth: AtomicUsize,
    sink: OnceCell<Arc<TailSink<M>>>,
}

impl<M: PipelineMessage> Pipeline<M> {
    pub(crate) fn new(channel: Weak<ChannelInner<M>>, executor: Arc<dyn EventExecutor>) -> Self {
        Self {
            channel,
            executor,
            entries: RwLock::new(Vec::new()),
            depth: AtomicUsize::new(0),
            sink: OnceCell::new(),
        }
    }

    /// The channel this pipeline belongs to, while it exists.
    #[must_use]
    pub fn channel(&self) -> Option<Channel<M>> {
        self.channel.upgrade().map(Channel::from_inner)
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.channel.upgrade().map(|c| c.id())
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn EventExecutor> {
        &self.executor
    }

    pub(crate) fn set_sink(&self, sink: Arc<TailSink<M>>) {
        let _ = self.sink.set(sink);
    }

    /// True while a handler callback of this pipeline is running.
    pub(crate) fn is_dispatching(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    fn enter(&self) -> DispatchGuard<'_> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        DispatchGuard(&self.depth)
    }

    pub(crate) fn new_promise(&self) -> CompletionFuture {
        self.channel
            .upgrade()
            .map_or_else(CompletionFuture::new, |c| c.new_promise())
    }

    pub(crate) fn prepend_reserve(&self) -> usize {
        self.channel
            .upgrade()
            .map_or(0, |c| c.options().prepend_reserve)
    }

    // ---------------------------------------------------------------------
    // structure
    // ---------------------------------------------------------------------

    pub fn add_first<H: ChannelHandler<M>>(self: &Arc<Self>, name: &str, handler: H) -> Result<()> {
        self.add(Position::First, name, Box::new(handler))
    }

    pub fn add_last<H: ChannelHandler<M>>(self: &Arc<Self>, name: &str, handler: H) -> Result<()> {
        self.add(Position::Last, name, Box::new(handler))
    }

    pub fn add_before<H: ChannelHandler<M>>(
        self: &Arc<Self>,
        base: &str,
        name: &str,
        handler: H,
    ) -> Result<()> {
        self.add(Position::Before(base.into()), name, Box::new(handler))
    }

    pub fn add_after<H: ChannelHandler<M>>(
        self: &Arc<Self>,
        base: &str,
        name: &str,
        handler: H,
    ) -> Result<()> {
        self.add(Position::After(base.into()), name, Box::new(handler))
    }

    /// `add_last` for an already boxed handler.
    pub fn add_last_boxed(self: &Arc<Self>, name: &str, handler: Box<dyn ChannelHandler<M>>) -> Result<()> {
        self.add(Position::Last, name, handler)
    }

    /// Remove the handler called `name`.
    ///
    /// `handler_before_remove` runs while it is still linked and
    /// `handler_removed` right after it is unlinked.
    pub fn remove(self: &Arc<Self>, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(KeelsonError::invalid_config(format!("no handler named '{name}'")));
        }
        let this = Arc::clone(self);
        let name: Arc<str> = name.into();
        self.executor.run_or_post(Box::new(move || {
            if let Some(entry) = this.find(&name) {
                this.unlink(&entry, true);
            }
        }));
        Ok(())
    }

    /// Swap the handler called `old` for `handler`, registered as `name`, at
    /// the same position.
    pub fn replace<H: ChannelHandler<M>>(self: &Arc<Self>, old: &str, name: &str, handler: H) -> Result<()> {
        {
            let entries = self.entries.read();
            if !entries.iter().any(|e| &*e.name == old) {
                return Err(KeelsonError::invalid_config(format!("no handler named '{old}'")));
            }
            if name != old && entries.iter().any(|e| &*e.name == name) {
                return Err(KeelsonError::invalid_config(format!("duplicate handler name '{name}'")));
            }
        }
        let entry = Self::new_entry(name, Box::new(handler));
        let this = Arc::clone(self);
        let old: Arc<str> = old.into();
        self.executor.run_or_post(Box::new(move || {
            if let Some(existing) = this.find(&old) {
                this.link(Position::After(Arc::clone(&old)), entry, false);
                this.unlink(&existing, true);
            }
        }));
        Ok(())
    }

    /// Handler names, head to tail.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.to_string()).collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| &*e.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Context of the handler called `name`.
    #[must_use]
    pub fn get_context(self: &Arc<Self>, name: &str) -> Option<HandlerContext<M>> {
        self.find(name).map(|e| self.context_for(&e, None))
    }

    fn new_entry(name: &str, handler: Box<dyn ChannelHandler<M>>) -> Arc<Entry<M>> {
        Arc::new(Entry {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            handler: Mutex::new(handler),
        })
    }

    fn find(&self, name: &str) -> Option<Arc<Entry<M>>> {
        self.entries.read().iter().find(|e| &*e.name == name).cloned()
    }

    fn context_for(self: &Arc<Self>, entry: &Entry<M>, detached_at: Option<usize>) -> HandlerContext<M> {
        HandlerContext::new(
            Arc::downgrade(self),
            Arc::clone(&self.executor),
            Arc::clone(&entry.name),
            Cursor::At {
                id: entry.id,
                detached_at,
            },
        )
    }

    fn add(self: &Arc<Self>, pos: Position, name: &str, handler: Box<dyn ChannelHandler<M>>) -> Result<()> {
        {
            let entries = self.entries.read();
            if entries.iter().any(|e| &*e.name == name) {
                return Err(KeelsonError::invalid_config(format!("duplicate handler name '{name}'")));
            }
            if let Position::Before(base) | Position::After(base) = &pos {
                if !entries.iter().any(|e| e.name == *base) {
                    return Err(KeelsonError::invalid_config(format!("no handler named '{base}'")));
                }
            }
        }
        let entry = Self::new_entry(name, handler);
        let this = Arc::clone(self);
        self.executor
            .run_or_post(Box::new(move || this.link(pos, entry, true)));
        Ok(())
    }

    /// Insert `entry` with its add callbacks. Runs on the executor.
    fn link(self: &Arc<Self>, pos: Position, entry: Arc<Entry<M>>, check_name: bool) {
        let ctx = self.context_for(&entry, None);
        let mut handler = entry.handler.lock();
        let _guard = self.enter();
        handler.handler_before_add(&ctx);
        {
            let mut entries = self.entries.write();
            if check_name && entries.iter().any(|e| e.name == entry.name) {
                warn!(handler = %entry.name, "duplicate handler name, not added");
                return;
            }
            let index = match &pos {
                Position::First => Some(0),
                Position::Last => Some(entries.len()),
                Position::Before(base) => entries.iter().position(|e| e.name == *base),
                Position::After(base) => entries.iter().position(|e| e.name == *base).map(|i| i + 1),
            };
            let Some(index) = index else {
                warn!(handler = %entry.name, "anchor handler vanished, not added");
                return;
            };
            entries.insert(index, Arc::clone(&entry));
        }
        trace!(channel = ?self.channel_id(), handler = %entry.name, "handler added");
        handler.handler_added(&ctx);
    }

    /// Unlink `entry` with its remove callbacks. Runs on the executor.
    ///
    /// A handler that is mid-callback is removed later (`defer_if_busy`) or,
    /// during teardown, unlinked without callbacks.
    fn unlink(self: &Arc<Self>, entry: &Arc<Entry<M>>, defer_if_busy: bool) {
        let Some(mut handler) = entry.handler.try_lock() else {
            if defer_if_busy {
                let (this, entry) = (Arc::clone(self), Arc::clone(entry));
                self.executor
                    .execute(Box::new(move || this.unlink(&entry, true)));
            } else {
                warn!(handler = %entry.name, "handler busy during teardown, removed without callbacks");
                self.entries.write().retain(|e| e.id != entry.id);
            }
            return;
        };
        let _guard = self.enter();
        handler.handler_before_remove(&self.context_for(entry, None));
        let index = {
            let mut entries = self.entries.write();
            let index = entries.iter().position(|e| e.id == entry.id);
            if let Some(i) = index {
                entries.remove(i);
            }
            index
        };
        trace!(channel = ?self.channel_id(), handler = %entry.name, "handler removed");
        handler.handler_removed(&self.context_for(entry, index));
    }

    /// Remove every handler, tail first.
    pub(crate) fn teardown(self: &Arc<Self>) {
        loop {
            let last = self.entries.read().last().cloned();
            match last {
                Some(entry) => self.unlink(&entry, false),
                None => break,
            }
        }
    }

    fn position_of(entries: &[Arc<Entry<M>>], id: u64) -> Option<usize> {
        entries.iter().position(|e| e.id == id)
    }

    fn next_inbound(&self, from: Cursor) -> Option<Arc<Entry<M>>> {
        let entries = self.entries.read();
        match from {
            Cursor::Head => entries.first().cloned(),
            Cursor::At { id, detached_at } => match Self::position_of(&entries, id) {
                Some(i) => entries.get(i + 1).cloned(),
                None => detached_at.and_then(|i| entries.get(i).cloned()),
            },
            Cursor::Tail => None,
        }
    }

    fn next_outbound(&self, from: Cursor) -> Option<Arc<Entry<M>>> {
        let entries = self.entries.read();
        match from {
            Cursor::Tail => entries.last().cloned(),
            Cursor::At { id, detached_at } => {
                let index = Self::position_of(&entries, id).or(detached_at)?;
                index.checked_sub(1).and_then(|i| entries.get(i).cloned())
            }
            Cursor::Head => None,
        }
    }

    // ---------------------------------------------------------------------
    // dispatch
    // ---------------------------------------------------------------------

    pub(crate) fn inbound(self: &Arc<Self>, from: Cursor, event: Inbound<M>) {
        if !self.executor.in_event_loop() {
            let this = Arc::clone(self);
            self.executor
                .execute(Box::new(move || this.inbound(from, event)));
            return;
        }
        match self.next_inbound(from) {
            Some(entry) => self.invoke_inbound(entry, event),
            None => self.tail(event),
        }
    }

    fn invoke_inbound(self: &Arc<Self>, entry: Arc<Entry<M>>, event: Inbound<M>) {
        let Some(mut handler) = entry.handler.try_lock() else {
            let (this, entry) = (Arc::clone(self), Arc::clone(&entry));
            self.executor
                .execute(Box::new(move || this.invoke_inbound(entry, event)));
            return;
        };
        let _guard = self.enter();
        let ctx = self.context_for(&entry, None);
        match event {
            Inbound::Created => handler.channel_created(&ctx),
            Inbound::Active => handler.channel_active(&ctx),
            Inbound::Inactive => handler.channel_inactive(&ctx),
            Inbound::Read(msg) => handler.channel_read(&ctx, msg),
            Inbound::ReadComplete => handler.channel_read_complete(&ctx),
            Inbound::Exception(err) => handler.exception_caught(&ctx, err),
            Inbound::User(ev) => handler.user_event(&ctx, ev),
            Inbound::Child(child) => handler.child_accepted(&ctx, child),
        }
    }

    fn tail(&self, event: Inbound<M>) {
        let sink = self.sink.get();
        match event {
            Inbound::Read(msg) => match sink {
                Some(sink) => sink.messages.lock().push_back(msg),
                None => debug!(
                    channel = ?self.channel_id(),
                    message = %msg.summary(),
                    "inbound message reached the tail, dropped"
                ),
            },
            Inbound::Exception(err) => match sink {
                Some(sink) => sink.exceptions.lock().push_back(err),
                None => warn!(
                    channel = ?self.channel_id(),
                    error = %err,
                    "exception reached the tail of the pipeline"
                ),
            },
            Inbound::User(ev) => match sink {
                Some(sink) => sink.user_events.lock().push_back(ev),
                None => trace!(channel = ?self.channel_id(), event = ?ev, "user event reached the tail"),
            },
            Inbound::Child(child) => {
                trace!(channel = ?self.channel_id(), child = %child.id(), "child accepted");
            }
            Inbound::Created | Inbound::Active | Inbound::Inactive | Inbound::ReadComplete => {}
        }
    }

    pub(crate) fn outbound(self: &Arc<Self>, from: Cursor, op: Outbound<M>) {
        if !self.executor.in_event_loop() {
            let this = Arc::clone(self);
            self.executor
                .execute(Box::new(move || this.outbound(from, op)));
            return;
        }
        match self.next_outbound(from) {
            Some(entry) => self.invoke_outbound(entry, op),
            None => self.head(op),
        }
    }

    fn invoke_outbound(self: &Arc<Self>, entry: Arc<Entry<M>>, op: Outbound<M>) {
        let Some(mut handler) = entry.handler.try_lock() else {
            let (this, entry) = (Arc::clone(self), Arc::clone(&entry));
            self.executor
                .execute(Box::new(move || this.invoke_outbound(entry, op)));
            return;
        };
        let _guard = self.enter();
        let ctx = self.context_for(&entry, None);
        match op {
            Outbound::Bind(addr, promise) => handler.bind(&ctx, addr, promise),
            Outbound::Connect(addr, promise) => handler.connect(&ctx, addr, promise),
            Outbound::Disconnect(promise) => handler.disconnect(&ctx, promise),
            Outbound::Close(promise) => handler.close(&ctx, promise),
            Outbound::Write(msg, promise) => handler.write(&ctx, msg, promise),
            Outbound::Flush => handler.flush(&ctx),
        }
    }

    fn head(&self, op: Outbound<M>) {
        match self.channel.upgrade() {
            Some(channel) => channel.head(op),
            None => op.fail_closed(),
        }
    }

    // ---------------------------------------------------------------------
    // entry points
    // ---------------------------------------------------------------------

    pub fn fire_channel_created(self: &Arc<Self>) {
        self.inbound(Cursor::Head, Inbound::Created);
    }

    pub fn fire_channel_active(self: &Arc<Self>) {
        self.inbound(Cursor::Head, Inbound::Active);
    }

    pub fn fire_channel_inactive(self: &Arc<Self>) {
        self.inbound(Cursor::Head, Inbound::Inactive);
    }

    pub fn fire_channel_read(self: &Arc<Self>, msg: M) {
        self.inbound(Cursor::Head, Inbound::Read(msg));
    }

    pub fn fire_channel_read_complete(self: &Arc<Self>) {
        self.inbound(Cursor::Head, Inbound::ReadComplete);
    }

    pub fn fire_exception_caught(self: &Arc<Self>, err: Arc<KeelsonError>) {
        self.inbound(Cursor::Head, Inbound::Exception(err));
    }

    pub fn fire_user_event(self: &Arc<Self>, event: UserEvent) {
        self.inbound(Cursor::Head, Inbound::User(event));
    }

    pub fn fire_child_accepted(self: &Arc<Self>, child: Channel<M>) {
        self.inbound(Cursor::Head, Inbound::Child(child));
    }

    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> CompletionFuture {
        let promise = self.new_promise();
        self.outbound(Cursor::Tail, Outbound::Bind(addr, promise.clone()));
        promise
    }

    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> CompletionFuture {
        let promise = self.new_promise();
        self.outbound(Cursor::Tail, Outbound::Connect(addr, promise.clone()));
        promise
    }

    pub fn disconnect(self: &Arc<Self>) -> CompletionFuture {
        let promise = self.new_promise();
        self.outbound(Cursor::Tail, Outbound::Disconnect(promise.clone()));
        promise
    }

    pub fn close(self: &Arc<Self>) -> CompletionFuture {
        let promise = self.new_promise();
        self.outbound(Cursor::Tail, Outbound::Close(promise.clone()));
        promise
    }

    pub fn write(self: &Arc<Self>, msg: M) -> CompletionFuture {
        let promise = self.new_promise();
        self.outbound(Cursor::Tail, Outbound::Write(msg, promise.clone()));
        promise
    }

    pub fn flush(self: &Arc<Self>) {
        self.outbound(Cursor::Tail, Outbound::Flush);
    }

    pub fn write_and_flush(self: &Arc<Self>, msg: M) -> CompletionFuture {
        let promise = self.write(msg);
        self.flush();
        promise
    }
}
