//! In-memory channel for handler tests.
//!
//! An [`EmbeddedChannel`] runs its pipeline on an [`EmbeddedExecutor`]: the
//! calling thread is the event loop, deferred tasks run when the harness says
//! so, and timers follow a virtual clock. Outbound buffers are captured by an
//! [`EmbeddedTransport`]; inbound messages, exceptions and user events that
//! reach the tail are kept for inspection.
//!
//! ```
//! use keelson_core::buffer::ByteBuffer;
//! use keelson_core::embedded::EmbeddedChannel;
//!
//! let ch = EmbeddedChannel::new();
//! ch.write_inbound(ByteBuffer::copied_from(b"hello"));
//! assert_eq!(ch.read_inbound().unwrap().readable_slice(), b"hello");
//! ```

use crate::buffer::ByteBuffer;
use crate::channel::{Channel, PipelineMessage};
use crate::error::{KeelsonError, Result};
use crate::executor::{EmbeddedExecutor, EventExecutor};
use crate::future::CompletionFuture;
use crate::options::ChannelOptions;
use crate::pipeline::{ChannelHandler, Pipeline, TailSink, UserEvent};
use crate::transport::{EmbeddedTransport, Transport};

use std::sync::Arc;
use std::time::Duration;

pub struct EmbeddedChannel<M: PipelineMessage = ByteBuffer> {
    channel: Channel<M>,
    executor: Arc<EmbeddedExecutor>,
    transport: Arc<EmbeddedTransport>,
    sink: Arc<TailSink<M>>,
}

impl<M: PipelineMessage> EmbeddedChannel<M> {
    /// An active channel with an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ChannelOptions::default())
    }

    #[must_use]
    pub fn with_options(options: ChannelOptions) -> Self {
        let ch = Self::inactive(options);
        ch.activate();
        ch
    }

    /// An active channel whose pipeline holds `handlers`, head to tail.
    pub fn with_handlers(handlers: Vec<(&str, Box<dyn ChannelHandler<M>>)>) -> Result<Self> {
        let ch = Self::inactive(ChannelOptions::default());
        for (name, handler) in handlers {
            ch.channel.pipeline().add_last_boxed(name, handler)?;
        }
        ch.activate();
        Ok(ch)
    }

    /// A channel in the `Created` state; call [`activate`](Self::activate)
    /// to fire `channel_created` and `channel_active`.
    #[must_use]
    pub fn inactive(options: ChannelOptions) -> Self {
        let executor = Arc::new(EmbeddedExecutor::new());
        let transport = Arc::new(EmbeddedTransport::new());
        let sink = Arc::new(TailSink::new());
        let loop_handle: Arc<dyn EventExecutor> = executor.clone();
        let channel_transport: Arc<dyn Transport> = transport.clone();
        let channel = Channel::create(loop_handle, options, None, move |_, _| channel_transport);
        channel.pipeline().set_sink(Arc::clone(&sink));
        Self {
            channel,
            executor,
            transport,
            sink,
        }
    }

    pub fn activate(&self) {
        if self.channel.is_active() || !self.channel.is_open() {
            return;
        }
        self.channel.pipeline().fire_channel_created();
        self.channel.activate();
        self.run_pending_tasks();
    }

    #[must_use]
    pub fn channel(&self) -> &Channel<M> {
        &self.channel
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline<M>> {
        self.channel.pipeline()
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<EmbeddedExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<EmbeddedTransport> {
        &self.transport
    }

    /// Fire `msg` as one read followed by a read-complete. Returns true if
    /// anything reached the tail.
    pub fn write_inbound(&self, msg: M) -> bool {
        let pipeline = self.channel.pipeline();
        pipeline.fire_channel_read(msg);
        pipeline.fire_channel_read_complete();
        self.run_pending_tasks();
        self.inbound_len() > 0
    }

    /// Feed each buffer as its own read.
    pub fn write_inbound_all<I>(&self, msgs: I) -> bool
    where
        I: IntoIterator<Item = M>,
    {
        for msg in msgs {
            self.write_inbound(msg);
        }
        self.inbound_len() > 0
    }

    pub fn read_inbound(&self) -> Option<M> {
        self.sink.messages.lock().pop_front()
    }

    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.sink.messages.lock().len()
    }

    /// Write and flush `msg` through the whole pipeline.
    pub fn write_outbound(&self, msg: M) -> CompletionFuture {
        let promise = self.channel.write_and_flush(msg);
        self.run_pending_tasks();
        promise
    }

    pub fn read_outbound(&self) -> Option<ByteBuffer> {
        self.transport.read_outbound()
    }

    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.transport.outbound_len()
    }

    pub fn read_exception(&self) -> Option<Arc<KeelsonError>> {
        self.sink.exceptions.lock().pop_front()
    }

    /// Fail with the oldest exception that reached the tail, if any.
    pub fn check_exception(&self) -> Result<()> {
        match self.read_exception() {
            Some(err) => Err(KeelsonError::Failed(err)),
            None => Ok(()),
        }
    }

    pub fn read_user_event(&self) -> Option<UserEvent> {
        self.sink.user_events.lock().pop_front()
    }

    /// Run deferred tasks until the queue is empty.
    pub fn run_pending_tasks(&self) -> usize {
        self.executor.run_pending()
    }

    /// Advance the virtual clock and run whatever became due.
    pub fn advance_time(&self, by: Duration) -> usize {
        self.executor.advance_time(by)
    }

    pub fn close(&self) -> CompletionFuture {
        let promise = self.channel.close();
        self.run_pending_tasks();
        promise
    }

    /// Close the channel. Returns true if inbound or outbound data is left
    /// unread.
    pub fn finish(&self) -> bool {
        self.close();
        self.inbound_len() > 0 || self.outbound_len() > 0
    }
}

impl<M: PipelineMessage> Default for EmbeddedChannel<M> {
    fn default() -> Self {
        Self::new()
    }
}
