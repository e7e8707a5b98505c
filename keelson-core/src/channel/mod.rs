//! Channels.
//!
//! A [`Channel`] is one network endpoint (listening or connected) bound to one
//! executor for its whole life. It owns a [`Pipeline`] of handlers and a
//! [`Transport`] at the socket end:
//!
//! ```text
//!  application
//!      ▲   │ write / flush / close / bind / connect
//!      │   ▼
//!  ┌─────────────────────────────┐
//!  │ Pipeline (head … tail)      │
//!  └─────────────────────────────┘
//!      ▲   │
//!      │   ▼
//!  Transport  ◄── read/write pumps on the event loop
//! ```
//!
//! Lifecycle: `Created → Active → Closed`. The close future resolves exactly
//! once, after the pipeline has been torn down.

mod registry;

pub use registry::{close_future_of, is_live, live_channels, parent_of};

use crate::acceptor::Acceptor;
use crate::buffer::ByteBuffer;
use crate::error::KeelsonError;
use crate::executor::{EventExecutor, Task};
use crate::future::CompletionFuture;
use crate::options::ChannelOptions;
use crate::pipeline::{Outbound, Pipeline};
use crate::transport::{configure_stream, IoEvents, TcpTransport, Transport};

use compio::net::TcpStream;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Process-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Active,
    Closed,
}

const CREATED: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSED: u8 = 2;

/// The closed set of message types a pipeline carries.
///
/// Transports only understand buffers: inbound bytes enter the pipeline
/// through `from_buffer`, and an outbound message must turn back into a
/// buffer by the time it reaches the head.
pub trait PipelineMessage: Send + Sized + 'static {
    fn from_buffer(buf: ByteBuffer) -> Self;

    /// The buffer form of this message, or the message itself if it has none.
    fn into_buffer(self) -> Result<ByteBuffer, Self>;

    /// Short description for logs.
    fn summary(&self) -> String {
        String::from("message")
    }
}

impl PipelineMessage for ByteBuffer {
    fn from_buffer(buf: ByteBuffer) -> Self {
        buf
    }

    fn into_buffer(self) -> Result<ByteBuffer, Self> {
        Ok(self)
    }

    fn summary(&self) -> String {
        format!("{} bytes: {}", self.readable_bytes(), self.hex_dump())
    }
}

pub(crate) struct ChannelInner<M: PipelineMessage> {
    me: Weak<ChannelInner<M>>,
    id: AtomicU64,
    parent: Option<Weak<ChannelInner<M>>>,
    executor: Arc<dyn EventExecutor>,
    options: ChannelOptions,
    pipeline: Arc<Pipeline<M>>,
    state: AtomicU8,
    transport: Mutex<Arc<dyn Transport>>,
    close_future: Mutex<CompletionFuture>,
    acceptor: OnceCell<Arc<Acceptor<M>>>,
}

/// Handle to a channel. Cheap to clone; all clones refer to the same channel.
pub struct Channel<M: PipelineMessage = ByteBuffer> {
    inner: Arc<ChannelInner<M>>,
}

impl<M: PipelineMessage> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn promise_for(executor: &Arc<dyn EventExecutor>, options: &ChannelOptions) -> CompletionFuture {
    if options.deadlock_check {
        CompletionFuture::with_executor(Arc::clone(executor))
    } else {
        CompletionFuture::new()
    }
}

impl<M: PipelineMessage> Channel<M> {
    /// Build a channel and register it as live. `transport` receives the new
    /// id and the event sink its pumps report to.
    pub(crate) fn create<F>(
        executor: Arc<dyn EventExecutor>,
        options: ChannelOptions,
        parent: Option<&Self>,
        transport: F,
    ) -> Self
    where
        F: FnOnce(ChannelId, Weak<dyn IoEvents>) -> Arc<dyn Transport>,
    {
        let id = registry::allocate_id();
        let close_future = promise_for(&executor, &options);
        let inner = Arc::new_cyclic(|me: &Weak<ChannelInner<M>>| {
            let events: Weak<dyn IoEvents> = me.clone();
            ChannelInner {
                me: me.clone(),
                id: AtomicU64::new(id.0),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                pipeline: Arc::new(Pipeline::new(me.clone(), Arc::clone(&executor))),
                executor,
                options,
                state: AtomicU8::new(CREATED),
                transport: Mutex::new(transport(id, events)),
                close_future: Mutex::new(close_future.clone()),
                acceptor: OnceCell::new(),
            }
        });
        registry::register(id, parent.map(Self::id), &close_future);
        debug!(channel = %id, "created");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner<M>>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id()
    }

    /// The listening channel that accepted this one.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Self::from_inner)
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn EventExecutor> {
        &self.inner.executor
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline<M>> {
        &self.inner.pipeline
    }

    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        match self.inner.state.load(Ordering::Acquire) {
            CREATED => ChannelState::Created,
            ACTIVE => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() != ChannelState::Closed
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport().local_addr()
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.transport().remote_addr()
    }

    /// Resolves once the channel is fully closed and torn down.
    #[must_use]
    pub fn close_future(&self) -> CompletionFuture {
        self.inner.close_future()
    }

    /// A pending future tied to this channel's executor.
    #[must_use]
    pub fn new_promise(&self) -> CompletionFuture {
        self.inner.new_promise()
    }

    /// A buffer with the configured prepend reserve in front of `capacity`.
    #[must_use]
    pub fn alloc_buffer(&self, capacity: usize) -> ByteBuffer {
        ByteBuffer::with_prepend(capacity, self.inner.options.prepend_reserve)
    }

    /// The accept side of a listening channel.
    #[must_use]
    pub fn acceptor(&self) -> Option<&Arc<Acceptor<M>>> {
        self.inner.acceptor.get()
    }

    pub fn bind(&self, addr: SocketAddr) -> CompletionFuture {
        self.inner.pipeline.bind(addr)
    }

    pub fn connect(&self, addr: SocketAddr) -> CompletionFuture {
        self.inner.pipeline.connect(addr)
    }

    pub fn disconnect(&self) -> CompletionFuture {
        self.inner.pipeline.disconnect()
    }

    pub fn close(&self) -> CompletionFuture {
        self.inner.pipeline.close()
    }

    pub fn write(&self, msg: M) -> CompletionFuture {
        self.inner.pipeline.write(msg)
    }

    pub fn flush(&self) {
        self.inner.pipeline.flush();
    }

    pub fn write_and_flush(&self, msg: M) -> CompletionFuture {
        self.inner.pipeline.write_and_flush(msg)
    }

    pub(crate) fn set_acceptor(&self, acceptor: Arc<Acceptor<M>>) {
        let _ = self.inner.acceptor.set(acceptor);
    }

    pub(crate) fn events(&self) -> Weak<dyn IoEvents> {
        let weak: Weak<ChannelInner<M>> = Arc::downgrade(&self.inner);
        weak
    }

    pub(crate) fn install_transport(&self, transport: Arc<dyn Transport>) {
        *self.inner.transport.lock() = transport;
    }

    /// Move `Created → Active` and fire `channel_active`.
    pub(crate) fn activate(&self) {
        if self.inner.mark_active() {
            self.inner.pipeline.fire_channel_active();
        }
    }

    /// Only this handle refers to the channel.
    pub(crate) fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner<M>> {
        Arc::downgrade(&self.inner)
    }

    /// Give a closed channel a new identity so it can carry another
    /// connection. Returns the new id.
    pub(crate) fn reset_for_reuse(&self) -> ChannelId {
        let inner = &self.inner;
        let id = registry::allocate_id();
        inner.id.store(id.0, Ordering::Release);
        let close_future = promise_for(&inner.executor, &inner.options);
        *inner.close_future.lock() = close_future.clone();
        inner.state.store(CREATED, Ordering::Release);
        let parent = self.parent().map(|p| p.id());
        registry::register(id, parent, &close_future);
        debug!(channel = %id, "reused");
        id
    }
}

impl<M: PipelineMessage> PartialEq for Channel<M> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<M: PipelineMessage> Eq for Channel<M> {}

impl<M: PipelineMessage> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<M: PipelineMessage> ChannelInner<M> {
    pub(crate) fn id(&self) -> ChannelId {
        ChannelId(self.id.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    fn is_current(&self, gen: ChannelId) -> bool {
        self.id() == gen
    }

    fn mark_active(&self) -> bool {
        self.state
            .compare_exchange(CREATED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport.lock())
    }

    fn close_future(&self) -> CompletionFuture {
        self.close_future.lock().clone()
    }

    pub(crate) fn new_promise(&self) -> CompletionFuture {
        promise_for(&self.executor, &self.options)
    }

    pub(crate) fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Outbound requests that passed every handler. Runs on the loop.
    pub(crate) fn head(&self, op: Outbound<M>) {
        match op {
            Outbound::Bind(addr, promise) => self.transport().bind(addr, promise),
            Outbound::Connect(addr, promise) => self.transport().connect(addr, promise),
            // stream transports have no half-open state: disconnect is close
            Outbound::Disconnect(promise) | Outbound::Close(promise) => self.close_now(promise),
            Outbound::Write(msg, promise) => {
                if self.state.load(Ordering::Acquire) == CLOSED {
                    promise.set_failure(KeelsonError::ChannelClosed);
                    return;
                }
                match msg.into_buffer() {
                    Ok(buf) => self.transport().write(buf, promise),
                    Err(msg) => {
                        debug!(channel = %self.id(), message = %msg.summary(), "unencoded message reached the head");
                        promise.set_failure(KeelsonError::Unsupported(
                            "write of a message that is not a buffer",
                        ));
                    }
                }
            }
            Outbound::Flush => self.transport().flush(),
        }
    }

    /// Close sequence. Runs on the loop.
    ///
    /// Transport first, then (for listeners) every child, then
    /// `channel_inactive`, pipeline teardown and finally the close future.
    pub(crate) fn close_now(&self, promise: CompletionFuture) {
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        if prev == CLOSED {
            self.close_future().cascade_to(&promise);
            return;
        }
        debug!(channel = %self.id(), "closing");
        self.transport().close();

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let was_active = prev == ACTIVE;
        let finish: Task = Box::new(move || me.finish_close(was_active, promise));
        match self.acceptor.get() {
            Some(acceptor) => when_all(acceptor.close_children(), finish),
            None => finish(),
        }
    }

    fn finish_close(self: Arc<Self>, was_active: bool, promise: CompletionFuture) {
        // Called from inside a handler: let the callback unwind first so the
        // final inactive pass and teardown see an idle pipeline.
        if self.pipeline.is_dispatching() {
            let executor = Arc::clone(&self.executor);
            executor.execute(Box::new(move || self.finish_close(was_active, promise)));
            return;
        }
        if was_active {
            self.pipeline.fire_channel_inactive();
        }
        self.pipeline.teardown();
        self.close_future().set_success(());
        promise.set_success(());
        debug!(channel = %self.id(), "closed");
    }

    fn fire_exception(&self, err: Arc<KeelsonError>) {
        self.pipeline.fire_exception_caught(err);
    }
}

/// Run `then` once every future in `futures` has resolved.
fn when_all(futures: Vec<CompletionFuture>, then: Task) {
    fn arrive(remaining: &AtomicUsize, then: &Mutex<Option<Task>>) {
        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let task = then.lock().take();
            if let Some(task) = task {
                task();
            }
        }
    }

    let remaining = Arc::new(AtomicUsize::new(futures.len() + 1));
    let then = Arc::new(Mutex::new(Some(then)));
    for f in futures {
        let (remaining, then) = (Arc::clone(&remaining), Arc::clone(&then));
        f.add_listener(move |_| arrive(&remaining, &then));
    }
    arrive(&remaining, &then);
}

impl<M: PipelineMessage> Drop for ChannelInner<M> {
    fn drop(&mut self) {
        let id = ChannelId(self.id.load(Ordering::Acquire));
        registry::unregister(id);
    }
}

impl<M: PipelineMessage> IoEvents for ChannelInner<M> {
    fn on_read(&self, gen: ChannelId, buf: ByteBuffer) {
        if self.is_current(gen) && self.is_active() {
            self.pipeline.fire_channel_read(M::from_buffer(buf));
        }
    }

    fn on_read_complete(&self, gen: ChannelId) {
        if self.is_current(gen) && self.is_active() {
            self.pipeline.fire_channel_read_complete();
        }
    }

    fn on_eof(&self, gen: ChannelId) {
        if self.is_current(gen) {
            debug!(channel = %gen, "peer closed the connection");
            self.close_now(self.new_promise());
        }
    }

    fn on_read_error(&self, gen: ChannelId, err: KeelsonError) {
        if self.is_current(gen) {
            self.fire_exception(Arc::new(err));
            self.close_now(self.new_promise());
        }
    }

    fn on_write_error(&self, gen: ChannelId, err: Arc<KeelsonError>) {
        if self.is_current(gen) {
            self.fire_exception(err);
        }
    }

    fn on_connected(&self, gen: ChannelId, stream: TcpStream, promise: CompletionFuture) {
        if !self.is_current(gen) || self.state.load(Ordering::Acquire) == CLOSED {
            promise.set_failure(KeelsonError::ChannelClosed);
            return;
        }
        configure_stream(&stream, &self.options, gen);
        let events: Weak<dyn IoEvents> = self.me.clone();
        let transport = TcpTransport::start(stream, gen, events, self.options.read_buffer_size);
        *self.transport.lock() = Arc::new(transport);
        let activated = self.mark_active();
        promise.set_success(());
        if activated {
            self.pipeline.fire_channel_active();
        }
    }

    fn on_bound(&self, gen: ChannelId, promise: CompletionFuture) {
        if !self.is_current(gen) {
            promise.set_failure(KeelsonError::ChannelClosed);
            return;
        }
        let activated = self.mark_active();
        promise.set_success(());
        if activated {
            self.pipeline.fire_channel_active();
        }
    }

    fn on_op_failed(&self, gen: ChannelId, err: KeelsonError, promise: CompletionFuture) {
        let err = Arc::new(err);
        promise.set_shared_failure(Arc::clone(&err));
        if self.is_current(gen) {
            self.fire_exception(err);
        }
    }

    fn on_child(&self, gen: ChannelId, stream: TcpStream, peer: SocketAddr) {
        if !self.is_current(gen) || !self.is_active() {
            return;
        }
        let (Some(acceptor), Some(me)) = (self.acceptor.get(), self.me.upgrade()) else {
            return;
        };
        acceptor.accept(&Channel::from_inner(me), stream, peer);
    }

    fn on_accept_error(&self, gen: ChannelId, err: KeelsonError) {
        if self.is_current(gen) {
            self.fire_exception(Arc::new(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EmbeddedExecutor;
    use crate::transport::EmbeddedTransport;

    fn unconnected() -> Channel {
        let executor: Arc<dyn EventExecutor> = Arc::new(EmbeddedExecutor::new());
        Channel::create(executor, ChannelOptions::default(), None, |_, _| {
            let transport: Arc<dyn Transport> = Arc::new(EmbeddedTransport::new());
            transport
        })
    }

    #[test]
    fn dropping_an_unclosed_channel_unregisters_it() {
        let channel = unconnected();
        let id = channel.id();
        let other = channel.clone();
        assert!(is_live(id));

        drop(channel);
        assert!(is_live(id));
        drop(other);
        assert!(!is_live(id));
        assert!(close_future_of(id).is_none());
    }
}
