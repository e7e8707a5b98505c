//! Builders that open listening and client channels.
//!
//! ```rust,no_run
//! use keelson_core::bootstrap::ServerBootstrap;
//! use keelson_core::channel::Channel;
//! use keelson_core::event_loop::EventLoop;
//! use keelson_core::logging::LoggingHandler;
//!
//! # fn main() -> keelson_core::error::Result<()> {
//! let event_loop = EventLoop::new("server")?;
//! let server: Channel = ServerBootstrap::new()
//!     .event_loop(&event_loop)
//!     .child_handler(|child| child.pipeline().add_last("log", LoggingHandler::default()))
//!     .bind("127.0.0.1:0".parse().unwrap())
//!     .get()?;
//! println!("listening on {:?}", server.local_addr());
//! server.close().wait()?;
//! # Ok(())
//! # }
//! ```
//!
//! Both builders need an executor backed by a compio runtime
//! ([`EventLoop`]); the listener and all of its children live on it.

use crate::acceptor::{Acceptor, ChildInitializer};
use crate::buffer::ByteBuffer;
use crate::channel::{Channel, PipelineMessage};
use crate::error::{KeelsonError, Result};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::executor::EventExecutor;
use crate::future::CompletionFuture;
use crate::options::ChannelOptions;
use crate::transport::{TcpConnectTransport, TcpListenerTransport, Transport};

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

type Initializer<M> = Arc<dyn Fn(&Channel<M>) -> Result<()> + Send + Sync>;

fn result_future<M: PipelineMessage>(executor: &Arc<dyn EventExecutor>) -> CompletionFuture<Channel<M>> {
    CompletionFuture::with_executor(Arc::clone(executor))
}

/// Resolve `result` with `channel` once `op` succeeds; otherwise close the
/// channel and pass the failure on.
fn complete_with<M: PipelineMessage>(
    op: &CompletionFuture,
    channel: Channel<M>,
    result: CompletionFuture<Channel<M>>,
) {
    op.add_listener(move |done| {
        if done.is_success() {
            result.set_success(channel);
            return;
        }
        let _ = channel.close();
        match done.cause() {
            Some(err) => result.set_shared_failure(err),
            None => result.cancel(),
        };
    });
}

fn init_or_close<M: PipelineMessage>(
    channel: &Channel<M>,
    init: Option<&Initializer<M>>,
    result: &CompletionFuture<Channel<M>>,
) -> bool {
    let Some(init) = init else {
        return true;
    };
    match init(channel) {
        Ok(()) => true,
        Err(e) => {
            warn!(channel = %channel.id(), error = %e, "channel initializer failed");
            let _ = channel.close();
            result.set_failure(e);
            false
        }
    }
}

/// Opens a listening channel whose accepted children get their pipelines
/// from `child_handler`.
pub struct ServerBootstrap<M: PipelineMessage = ByteBuffer> {
    executor: Option<Arc<dyn EventExecutor>>,
    options: ChannelOptions,
    child_options: ChannelOptions,
    handler: Option<Initializer<M>>,
    child_handler: Option<ChildInitializer<M>>,
}

impl<M: PipelineMessage> ServerBootstrap<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            options: ChannelOptions::default(),
            child_options: ChannelOptions::default(),
            handler: None,
            child_handler: None,
        }
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn EventExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn event_loop(self, event_loop: &EventLoop) -> Self {
        self.executor(event_loop.executor())
    }

    /// Run on the group's next loop.
    #[must_use]
    pub fn group(self, group: &EventLoopGroup) -> Self {
        self.executor(group.next().executor())
    }

    /// Options of the listening channel.
    #[must_use]
    pub fn options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// Options of every accepted child.
    #[must_use]
    pub fn child_options(mut self, options: ChannelOptions) -> Self {
        self.child_options = options;
        self
    }

    /// Set up the listening channel's own pipeline.
    #[must_use]
    pub fn handler<F>(mut self, init: F) -> Self
    where
        F: Fn(&Channel<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(init));
        self
    }

    /// Set up each accepted child's pipeline.
    #[must_use]
    pub fn child_handler<F>(mut self, init: F) -> Self
    where
        F: Fn(&Channel<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.child_handler = Some(Arc::new(init));
        self
    }

    /// Create the listening channel and bind it to `addr`.
    ///
    /// The future resolves with the channel once it is listening.
    pub fn bind(&self, addr: SocketAddr) -> CompletionFuture<Channel<M>> {
        let Some(executor) = self.executor.clone() else {
            return CompletionFuture::failed(KeelsonError::invalid_config("no executor configured"));
        };
        let Some(child_handler) = self.child_handler.clone() else {
            return CompletionFuture::failed(KeelsonError::invalid_config("no child handler configured"));
        };
        if let Err(e) = self.options.validate().and(self.child_options.validate()) {
            return CompletionFuture::failed(e);
        }

        let result = result_future(&executor);
        let (options, child_options, handler) =
            (self.options.clone(), self.child_options.clone(), self.handler.clone());
        let (loop_handle, promise) = (Arc::clone(&executor), result.clone());
        executor.execute(Box::new(move || {
            let channel: Channel<M> = Channel::create(
                Arc::clone(&loop_handle),
                options,
                None,
                |id, events| -> Arc<dyn Transport> { Arc::new(TcpListenerTransport::new(id, events)) },
            );
            channel.set_acceptor(Acceptor::new(loop_handle, child_handler, child_options));
            if !init_or_close(&channel, handler.as_ref(), &promise) {
                return;
            }
            debug!(channel = %channel.id(), %addr, "binding");
            channel.pipeline().fire_channel_created();
            let bound = channel.bind(addr);
            complete_with(&bound, channel, promise);
        }));
        result
    }
}

impl<M: PipelineMessage> Default for ServerBootstrap<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens client channels.
pub struct Bootstrap<M: PipelineMessage = ByteBuffer> {
    executor: Option<Arc<dyn EventExecutor>>,
    options: ChannelOptions,
    handler: Option<Initializer<M>>,
}

impl<M: PipelineMessage> Bootstrap<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            options: ChannelOptions::default(),
            handler: None,
        }
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn EventExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn event_loop(self, event_loop: &EventLoop) -> Self {
        self.executor(event_loop.executor())
    }

    #[must_use]
    pub fn group(self, group: &EventLoopGroup) -> Self {
        self.executor(group.next().executor())
    }

    #[must_use]
    pub fn options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn handler<F>(mut self, init: F) -> Self
    where
        F: Fn(&Channel<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(init));
        self
    }

    /// Create a channel and connect it to `addr`.
    ///
    /// Resolves with the channel once it is connected and active. A refused
    /// or timed out connect fails the future and closes the channel.
    pub fn connect(&self, addr: SocketAddr) -> CompletionFuture<Channel<M>> {
        let Some(executor) = self.executor.clone() else {
            return CompletionFuture::failed(KeelsonError::invalid_config("no executor configured"));
        };
        if let Err(e) = self.options.validate() {
            return CompletionFuture::failed(e);
        }

        let result = result_future(&executor);
        let (options, handler) = (self.options.clone(), self.handler.clone());
        let (loop_handle, promise) = (Arc::clone(&executor), result.clone());
        executor.execute(Box::new(move || {
            let timeout = options.connect_timeout;
            let channel: Channel<M> = Channel::create(loop_handle, options, None, |id, events| -> Arc<dyn Transport> {
                Arc::new(TcpConnectTransport::new(id, events, timeout))
            });
            if !init_or_close(&channel, handler.as_ref(), &promise) {
                return;
            }
            debug!(channel = %channel.id(), %addr, "connecting");
            channel.pipeline().fire_channel_created();
            let connected = channel.connect(addr);
            complete_with(&connected, channel, promise);
        }));
        result
    }
}

impl<M: PipelineMessage> Default for Bootstrap<M> {
    fn default() -> Self {
        Self::new()
    }
}
