//! A pass-through handler that logs every event it sees.

use crate::buffer::ByteBuffer;
use crate::channel::{Channel, PipelineMessage};
use crate::error::KeelsonError;
use crate::future::CompletionFuture;
use crate::pipeline::{ChannelHandler, HandlerContext, UserEvent};

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Level;

// tracing needs the level at the call site
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            tracing::error!($($arg)+);
        } else if level == Level::WARN {
            tracing::warn!($($arg)+);
        } else if level == Level::INFO {
            tracing::info!($($arg)+);
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    }};
}

/// Logs inbound and outbound events, payloads as hex, then forwards them.
///
/// Place it next to the socket to see raw bytes, or after a decoder to see
/// decoded messages.
pub struct LoggingHandler<M: PipelineMessage = ByteBuffer> {
    level: Level,
    _message: PhantomData<fn(M)>,
}

impl<M: PipelineMessage> LoggingHandler<M> {
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            _message: PhantomData,
        }
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }
}

impl<M: PipelineMessage> Default for LoggingHandler<M> {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

fn channel_label<M: PipelineMessage>(ctx: &HandlerContext<M>) -> String {
    ctx.channel()
        .map_or_else(|| String::from("-"), |c| c.id().to_string())
}

impl<M: PipelineMessage> ChannelHandler<M> for LoggingHandler<M> {
    fn channel_created(&mut self, ctx: &HandlerContext<M>) {
        log_at!(self.level, channel = %channel_label(ctx), "CREATED");
        ctx.fire_channel_created();
    }

    fn channel_active(&mut self, ctx: &HandlerContext<M>) {
        log_at!(self.level, channel = %channel_label(ctx), "ACTIVE");
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext<M>) {
        log_at!(self.level, channel = %channel_label(ctx), "INACTIVE");
        ctx.fire_channel_inactive();
    }

    fn channel_read(&mut self, ctx: &HandlerContext<M>, msg: M) {
        log_at!(self.level, channel = %channel_label(ctx), message = %msg.summary(), "READ");
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext<M>) {
        log_at!(self.level, channel = %channel_label(ctx), "READ COMPLETE");
        ctx.fire_channel_read_complete();
    }

    fn exception_caught(&mut self, ctx: &HandlerContext<M>, err: Arc<KeelsonError>) {
        log_at!(self.level, channel = %channel_label(ctx), error = %err, "EXCEPTION");
        ctx.fire_exception_caught(err);
    }

    fn user_event(&mut self, ctx: &HandlerContext<M>, event: UserEvent) {
        log_at!(self.level, channel = %channel_label(ctx), event = ?event, "USER EVENT");
        ctx.fire_user_event(event);
    }

    fn child_accepted(&mut self, ctx: &HandlerContext<M>, child: Channel<M>) {
        log_at!(
            self.level,
            channel = %channel_label(ctx),
            child = %child.id(),
            peer = ?child.remote_addr(),
            "ACCEPTED"
        );
        ctx.fire_child_accepted(child);
    }

    fn bind(&mut self, ctx: &HandlerContext<M>, addr: SocketAddr, promise: CompletionFuture) {
        log_at!(self.level, channel = %channel_label(ctx), %addr, "BIND");
        ctx.bind_with(addr, promise);
    }

    fn connect(&mut self, ctx: &HandlerContext<M>, addr: SocketAddr, promise: CompletionFuture) {
        log_at!(self.level, channel = %channel_label(ctx), %addr, "CONNECT");
        ctx.connect_with(addr, promise);
    }

    fn disconnect(&mut self, ctx: &HandlerContext<M>, promise: CompletionFuture) {
        log_at!(self.level, channel = %channel_label(ctx), "DISCONNECT");
        ctx.disconnect_with(promise);
    }

    fn close(&mut self, ctx: &HandlerContext<M>, promise: CompletionFuture) {
        log_at!(self.level, channel = %channel_label(ctx), "CLOSE");
        ctx.close_with(promise);
    }

    fn write(&mut self, ctx: &HandlerContext<M>, msg: M, promise: CompletionFuture) {
        log_at!(self.level, channel = %channel_label(ctx), message = %msg.summary(), "WRITE");
        ctx.write_with(msg, promise);
    }

    fn flush(&mut self, ctx: &HandlerContext<M>) {
        log_at!(self.level, channel = %channel_label(ctx), "FLUSH");
        ctx.flush();
    }
}
