use super::HandlerContext;
use crate::buffer::ByteBuffer;
use crate::channel::{Channel, PipelineMessage};
use crate::error::KeelsonError;
use crate::future::CompletionFuture;
use crate::idle::IdleStateEvent;

use std::net::SocketAddr;
use std::sync::Arc;

/// Application-defined or built-in events that travel inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Idle(IdleStateEvent),
    Custom(Arc<str>),
}

/// A pipeline stage.
///
/// Every method defaults to passing the event on unchanged, so a handler
/// only overrides what it intercepts. Inbound methods forward toward the
/// tail, outbound methods toward the head.
///
/// Handlers are called on the channel's executor, one event at a time.
///
/// # Example
///
/// ```
/// use keelson_core::buffer::ByteBuffer;
/// use keelson_core::pipeline::{ChannelHandler, HandlerContext};
///
/// /// Echoes every inbound buffer back to the peer.
/// struct Echo;
///
/// impl ChannelHandler for Echo {
///     fn channel_read(&mut self, ctx: &HandlerContext, msg: ByteBuffer) {
///         ctx.write(msg);
///     }
///
///     fn channel_read_complete(&mut self, ctx: &HandlerContext) {
///         ctx.flush();
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait ChannelHandler<M: PipelineMessage = ByteBuffer>: Send + 'static {
    fn handler_before_add(&mut self, ctx: &HandlerContext<M>) {}

    fn handler_added(&mut self, ctx: &HandlerContext<M>) {}

    fn handler_before_remove(&mut self, ctx: &HandlerContext<M>) {}

    /// Called once the handler is unlinked. The context still forwards to
    /// the neighbours the handler had.
    fn handler_removed(&mut self, ctx: &HandlerContext<M>) {}

    fn channel_created(&mut self, ctx: &HandlerContext<M>) {
        ctx.fire_channel_created();
    }

    fn channel_active(&mut self, ctx: &HandlerContext<M>) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext<M>) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&mut self, ctx: &HandlerContext<M>, msg: M) {
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext<M>) {
        ctx.fire_channel_read_complete();
    }

    fn exception_caught(&mut self, ctx: &HandlerContext<M>, err: Arc<KeelsonError>) {
        ctx.fire_exception_caught(err);
    }

    fn user_event(&mut self, ctx: &HandlerContext<M>, event: UserEvent) {
        ctx.fire_user_event(event);
    }

    /// A listening channel accepted `child`. The child's own pipeline has
    /// already been initialised.
    fn child_accepted(&mut self, ctx: &HandlerContext<M>, child: Channel<M>) {
        ctx.fire_child_accepted(child);
    }

    fn bind(&mut self, ctx: &HandlerContext<M>, addr: SocketAddr, promise: CompletionFuture) {
        ctx.bind_with(addr, promise);
    }

    fn connect(&mut self, ctx: &HandlerContext<M>, addr: SocketAddr, promise: CompletionFuture) {
        ctx.connect_with(addr, promise);
    }

    fn disconnect(&mut self, ctx: &HandlerContext<M>, promise: CompletionFuture) {
        ctx.disconnect_with(promise);
    }

    fn close(&mut self, ctx: &HandlerContext<M>, promise: CompletionFuture) {
        ctx.close_with(promise);
    }

    fn write(&mut self, ctx: &HandlerContext<M>, msg: M, promise: CompletionFuture) {
        ctx.write_with(msg, promise);
    }

    fn flush(&mut self, ctx: &HandlerContext<M>) {
        ctx.flush();
    }
}
