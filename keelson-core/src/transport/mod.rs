//! Transports: the socket side of a channel.
//!
//! Outbound requests that travel through the whole pipeline end up at the
//! channel's [`Transport`]. Transports are `Send + Sync` handles; the sockets
//! themselves live inside futures spawned on the owning event loop and talk
//! back to the channel through [`IoEvents`].
//!
//! Every event carries the [`ChannelId`] the transport was started for. A
//! pooled channel gets a fresh id when it is reused, so events from a previous
//! connection's pumps are recognised and dropped.

mod embedded;
mod tcp;

pub use embedded::EmbeddedTransport;
pub(crate) use tcp::{configure_stream, TcpConnectTransport, TcpListenerTransport, TcpTransport};

use crate::buffer::ByteBuffer;
use crate::channel::ChannelId;
use crate::error::KeelsonError;
use crate::future::CompletionFuture;

use compio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::Arc;

/// Socket-facing end of a channel.
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Queue `buf`. It reaches the socket on the next `flush`; `promise`
    /// resolves once it has been written (or failed).
    fn write(&self, buf: ByteBuffer, promise: CompletionFuture);

    fn flush(&self);

    /// Stop all I/O. Unflushed writes fail with `ChannelClosed`.
    fn close(&self);

    fn bind(&self, addr: SocketAddr, promise: CompletionFuture) {
        let _ = addr;
        promise.set_failure(KeelsonError::Unsupported("bind"));
    }

    fn connect(&self, addr: SocketAddr, promise: CompletionFuture) {
        let _ = addr;
        promise.set_failure(KeelsonError::Unsupported("connect"));
    }
}

/// Callbacks from socket pumps into the owning channel. Always invoked on the
/// channel's event loop thread.
pub(crate) trait IoEvents: Send + Sync + 'static {
    fn on_read(&self, gen: ChannelId, buf: ByteBuffer);

    fn on_read_complete(&self, gen: ChannelId);

    /// Peer closed its side of the connection.
    fn on_eof(&self, gen: ChannelId);

    fn on_read_error(&self, gen: ChannelId, err: KeelsonError);

    fn on_write_error(&self, gen: ChannelId, err: Arc<KeelsonError>);

    fn on_connected(&self, gen: ChannelId, stream: TcpStream, promise: CompletionFuture);

    fn on_bound(&self, gen: ChannelId, promise: CompletionFuture);

    /// A bind or connect attempt failed.
    fn on_op_failed(&self, gen: ChannelId, err: KeelsonError, promise: CompletionFuture);

    fn on_child(&self, gen: ChannelId, stream: TcpStream, peer: SocketAddr);

    fn on_accept_error(&self, gen: ChannelId, err: KeelsonError);
}
