use super::{Cursor, Inbound, Outbound, Pipeline, UserEvent};
use crate::buffer::ByteBuffer;
use crate::channel::{Channel, PipelineMessage};
use crate::error::KeelsonError;
use crate::executor::EventExecutor;
use crate::future::CompletionFuture;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// A handler's position in its pipeline.
///
/// `fire_*` methods pass an inbound event to the next handler toward the
/// tail; outbound methods pass a request to the next handler toward the
/// head. Contexts are cheap to clone and may be kept (for timers, say) and
/// used from any thread: calls off the executor are posted to it.
pub struct HandlerContext<M: PipelineMessage = ByteBuffer> {
    pipeline: Weak<Pipeline<M>>,
    executor: Arc<dyn EventExecutor>,
    name: Arc<str>,
    cursor: Cursor,
}

impl<M: PipelineMessage> Clone for HandlerContext<M> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            executor: Arc::clone(&self.executor),
            name: Arc::clone(&self.name),
            cursor: self.cursor,
        }
    }
}

impl<M: PipelineMessage> HandlerContext<M> {
    pub(crate) fn new(
        pipeline: Weak<Pipeline<M>>,
        executor: Arc<dyn EventExecutor>,
        name: Arc<str>,
        cursor: Cursor,
    ) -> Self {
        Self {
            pipeline,
            executor,
            name,
            cursor,
        }
    }

    /// The name the handler was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn EventExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn pipeline(&self) -> Option<Arc<Pipeline<M>>> {
        self.pipeline.upgrade()
    }

    #[must_use]
    pub fn channel(&self) -> Option<Channel<M>> {
        self.pipeline.upgrade().and_then(|p| p.channel())
    }

    #[must_use]
    pub fn new_promise(&self) -> CompletionFuture {
        self.pipeline
            .upgrade()
            .map_or_else(CompletionFuture::new, |p| p.new_promise())
    }

    /// A buffer with the channel's prepend reserve in front of `capacity`.
    #[must_use]
    pub fn alloc_buffer(&self, capacity: usize) -> ByteBuffer {
        let reserve = self.pipeline.upgrade().map_or(0, |p| p.prepend_reserve());
        ByteBuffer::with_prepend(capacity, reserve)
    }

    fn inbound(&self, event: Inbound<M>) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.inbound(self.cursor, event);
        }
    }

    fn outbound(&self, op: Outbound<M>) {
        match self.pipeline.upgrade() {
            Some(pipeline) => pipeline.outbound(self.cursor, op),
            None => op.fail_closed(),
        }
    }

    pub fn fire_channel_created(&self) {
        self.inbound(Inbound::Created);
    }

    pub fn fire_channel_active(&self) {
        self.inbound(Inbound::Active);
    }

    pub fn fire_channel_inactive(&self) {
        self.inbound(Inbound::Inactive);
    }

    pub fn fire_channel_read(&self, msg: M) {
        self.inbound(Inbound::Read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        self.inbound(Inbound::ReadComplete);
    }

    pub fn fire_exception_caught(&self, err: Arc<KeelsonError>) {
        self.inbound(Inbound::Exception(err));
    }

    pub fn fire_user_event(&self, event: UserEvent) {
        self.inbound(Inbound::User(event));
    }

    pub fn fire_child_accepted(&self, child: Channel<M>) {
        self.inbound(Inbound::Child(child));
    }

    pub fn bind(&self, addr: SocketAddr) -> CompletionFuture {
        let promise = self.new_promise();
        self.bind_with(addr, promise.clone());
        promise
    }

    pub fn bind_with(&self, addr: SocketAddr, promise: CompletionFuture) {
        self.outbound(Outbound::Bind(addr, promise));
    }

    pub fn connect(&self, addr: SocketAddr) -> CompletionFuture {
        let promise = self.new_promise();
        self.connect_with(addr, promise.clone());
        promise
    }

    pub fn connect_with(&self, addr: SocketAddr, promise: CompletionFuture) {
        self.outbound(Outbound::Connect(addr, promise));
    }

    pub fn disconnect(&self) -> CompletionFuture {
        let promise = self.new_promise();
        self.disconnect_with(promise.clone());
        promise
    }

    pub fn disconnect_with(&self, promise: CompletionFuture) {
        self.outbound(Outbound::Disconnect(promise));
    }

    pub fn close(&self) -> CompletionFuture {
        let promise = self.new_promise();
        self.close_with(promise.clone());
        promise
    }

    pub fn close_with(&self, promise: CompletionFuture) {
        self.outbound(Outbound::Close(promise));
    }

    pub fn write(&self, msg: M) -> CompletionFuture {
        let promise = self.new_promise();
        self.write_with(msg, promise.clone());
        promise
    }

    pub fn write_with(&self, msg: M, promise: CompletionFuture) {
        self.outbound(Outbound::Write(msg, promise));
    }

    pub fn flush(&self) {
        self.outbound(Outbound::Flush);
    }

    pub fn write_and_flush(&self, msg: M) -> CompletionFuture {
        let promise = self.write(msg);
        self.flush();
        promise
    }
}

impl<M: PipelineMessage> fmt::Debug for HandlerContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("name", &self.name)
            .field("cursor", &self.cursor)
            .finish()
    }
}
