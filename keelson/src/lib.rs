//! # Keelson
//!
//! An asynchronous channel engine built on `io_uring` (via `compio`).
//!
//! ## Architecture
//!
//! Keelson is structured as a **channel kernel** with a protocol layer on top:
//!
//! - **`keelson-core`**: byte buffers, completion futures, event loops,
//!   channels, handler pipelines, the accept side and bootstraps
//! - **`keelson-codec`**: resumable (replaying) decoders, framing codecs and
//!   encoders, all sans-IO
//! - **`keelson`**: Public API surface (this crate)
//!
//! ## Quick Start
//!
//! ### Line echo server
//!
//! ```rust,no_run
//! use keelson::prelude::*;
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {
//!     fn channel_read(&mut self, ctx: &HandlerContext, line: ByteBuffer) {
//!         ctx.write(line);
//!     }
//!
//!     fn channel_read_complete(&mut self, ctx: &HandlerContext) {
//!         ctx.flush();
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let group = EventLoopGroup::new()?;
//! let server: Channel = ServerBootstrap::new()
//!     .group(&group)
//!     .child_handler(|child| {
//!         let pipeline = child.pipeline();
//!         pipeline.add_last("lines", DecoderHandler::new(DelimiterDecoder::new(DelimiterConfig::lines(1024)?)))?;
//!         pipeline.add_last("echo", Echo)
//!     })
//!     .bind("127.0.0.1:7000".parse().unwrap())
//!     .get()?;
//!
//! server.close_future().wait()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Decoding without a channel
//!
//! ```rust
//! use keelson::prelude::*;
//!
//! let mut replies = ReplayingDecoder::new(ReplyDecoder::default());
//! assert!(replies.feed(ByteBuffer::copied_from(b"+O")).is_empty());
//! let events = replies.feed(ByteBuffer::copied_from(b"K\r\n"));
//! assert!(matches!(&events[..], [DecodeEvent::Message(Reply::Status(s))] if s == "OK"));
//! ```
//!
//! ## Threading
//!
//! Every channel belongs to exactly one event loop. Handlers run on that
//! loop's thread, one event at a time; calls from other threads are queued
//! onto it. Blocking on a future from its own loop is refused with
//! `BlockingInEventLoop` instead of deadlocking.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

// Re-export core types
pub use bytes::Bytes;

pub use keelson_codec as codec;
pub use keelson_core::{
    acceptor, bootstrap, buffer, channel, embedded, error, event_loop, executor, future, idle, logging, options,
    pipeline, transport,
};

/// Everything a typical application needs.
///
/// ```rust
/// use keelson::prelude::*;
/// ```
pub mod prelude {
    pub use keelson_codec::prelude::*;
    pub use keelson_core::prelude::*;
}
