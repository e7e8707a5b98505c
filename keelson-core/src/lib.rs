//! Keelson Core
//!
//! The channel engine the protocol crates build on:
//! - Zero-copy byte buffers with reader/writer indices (`buffer`)
//! - Resolve-once completion futures with listeners (`future`)
//! - Executors and compio-backed event loops (`executor`, `event_loop`)
//! - Channels, handler pipelines and transports (`channel`, `pipeline`, `transport`)
//! - Accept side, bootstraps and the in-memory test channel (`acceptor`, `bootstrap`, `embedded`)
//! - Built-in handlers (`idle`, `logging`)
//! - Error types (`error`)

// The tcp transport needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod acceptor;
pub mod bootstrap;
pub mod buffer;
pub mod channel;
pub mod embedded;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod future;
pub mod idle;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::bootstrap::{Bootstrap, ServerBootstrap};
    pub use crate::buffer::{ByteBuffer, ByteOrder, CompositeBuffer};
    pub use crate::channel::{Channel, ChannelId, ChannelState, PipelineMessage};
    pub use crate::embedded::EmbeddedChannel;
    pub use crate::error::{KeelsonError, Result};
    pub use crate::event_loop::{EventLoop, EventLoopGroup};
    pub use crate::executor::{EventExecutor, TimerHandle};
    pub use crate::future::CompletionFuture;
    pub use crate::idle::{IdleState, IdleStateEvent, IdleStateHandler};
    pub use crate::logging::LoggingHandler;
    pub use crate::options::ChannelOptions;
    pub use crate::pipeline::{ChannelHandler, HandlerContext, Pipeline, UserEvent};
}
