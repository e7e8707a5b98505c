//! TCP transports on compio.
//!
//! A connection is driven by two futures on the owning loop (split-pump):
//! - read pump: kernel → pipeline, one `ByteBuffer` per completed read;
//! - write pump: queued buffers → kernel, released in batches on flush.
//!
//! The pumps never share mutable state. The transport handle only holds the
//! senders that feed them, so it can be used from any thread.
//!
//! # Safety
//!
//! Socket options are set through a `socket2::SockRef` over a borrowed
//! descriptor, which never closes it.

#![allow(unsafe_code)]

use super::{IoEvents, Transport};
use crate::buffer::ByteBuffer;
use crate::channel::ChannelId;
use crate::error::KeelsonError;
use crate::event_loop::spawn_local;
use crate::future::CompletionFuture;
use crate::options::ChannelOptions;

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use parking_lot::Mutex;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Apply the socket-level parts of `options` to a fresh connection.
///
/// A failure is logged and the connection keeps the OS defaults.
pub(crate) fn configure_stream(stream: &TcpStream, options: &ChannelOptions, channel: ChannelId) {
    if !options.tcp_nodelay {
        return;
    }
    match with_sock_ref(stream, |sock| sock.set_nodelay(true)) {
        Ok(()) => trace!(channel = %channel, "TCP_NODELAY set"),
        Err(e) => debug!(channel = %channel, error = %e, "TCP_NODELAY not applied"),
    }
}

#[cfg(unix)]
fn with_sock_ref<T>(stream: &TcpStream, f: impl FnOnce(SockRef<'_>) -> io::Result<T>) -> io::Result<T> {
    use std::os::fd::{AsRawFd, BorrowedFd};
    // SAFETY: `stream` owns the descriptor and outlives the borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    f(SockRef::from(&fd))
}

#[cfg(not(unix))]
fn with_sock_ref<T>(_stream: &TcpStream, _f: impl FnOnce(SockRef<'_>) -> io::Result<T>) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "socket options need a unix descriptor"))
}

enum WriteCmd {
    Write(ByteBuffer, CompletionFuture),
    Flush,
    Close,
}

/// A connected TCP stream.
pub(crate) struct TcpTransport {
    writes: Sender<WriteCmd>,
    stop_reading: Mutex<Option<Sender<()>>>,
    open: AtomicBool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl TcpTransport {
    /// Split `stream` and start both pumps. Must run on the event loop that
    /// owns `gen`.
    pub(crate) fn start(
        stream: TcpStream,
        gen: ChannelId,
        events: Weak<dyn IoEvents>,
        read_buffer_size: usize,
    ) -> Self {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded(1);

        spawn_local(read_pump(reader, gen, events.clone(), stop_rx, read_buffer_size));
        spawn_local(write_pump(writer, gen, events, write_rx));

        Self {
            writes: write_tx,
            stop_reading: Mutex::new(Some(stop_tx)),
            open: AtomicBool::new(true),
            local,
            remote,
        }
    }
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn write(&self, buf: ByteBuffer, promise: CompletionFuture) {
        if !self.open.load(Ordering::Acquire) {
            promise.set_failure(KeelsonError::ChannelClosed);
            return;
        }
        if let Err(flume::SendError(WriteCmd::Write(_, promise))) =
            self.writes.send(WriteCmd::Write(buf, promise))
        {
            promise.set_failure(KeelsonError::ChannelClosed);
        }
    }

    fn flush(&self) {
        let _ = self.writes.send(WriteCmd::Flush);
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the stop sender wakes the read pump.
        self.stop_reading.lock().take();
        let _ = self.writes.send(WriteCmd::Close);
    }
}

async fn read_pump<R: AsyncRead>(
    mut stream: R,
    gen: ChannelId,
    events: Weak<dyn IoEvents>,
    stop: Receiver<()>,
    buffer_size: usize,
) {
    loop {
        let buf: Vec<u8> = Vec::with_capacity(buffer_size);
        let BufResult(res, mut buf) = select! {
            _ = stop.recv_async().fuse() => break,
            read = AsyncRead::read(&mut stream, buf).fuse() => read,
        };

        let Some(events) = events.upgrade() else {
            break;
        };
        match res {
            Ok(0) => {
                trace!(channel = %gen, "EOF");
                events.on_eof(gen);
                break;
            }
            Ok(n) => {
                trace!(channel = %gen, bytes = n, "read");
                buf.truncate(n);
                events.on_read(gen, ByteBuffer::from(buf));
                events.on_read_complete(gen);
            }
            Err(e) => {
                debug!(channel = %gen, error = %e, "read failed");
                events.on_read_error(gen, KeelsonError::Io(e));
                break;
            }
        }
    }
}

async fn write_pump<W: AsyncWrite>(
    mut stream: W,
    gen: ChannelId,
    events: Weak<dyn IoEvents>,
    cmds: Receiver<WriteCmd>,
) {
    let mut queued: Vec<(ByteBuffer, CompletionFuture)> = Vec::new();

    while let Ok(cmd) = cmds.recv_async().await {
        match cmd {
            WriteCmd::Write(buf, promise) => queued.push((buf, promise)),
            WriteCmd::Flush => {
                let mut batch = std::mem::take(&mut queued).into_iter();
                while let Some((buf, promise)) = batch.next() {
                    if !buf.is_readable() {
                        promise.set_success(());
                        continue;
                    }
                    // Owned Vec for IoBuf compatibility
                    let data = buf.readable_slice().to_vec();
                    let BufResult(res, _) = stream.write_all(data).await;
                    match res {
                        Ok(()) => {
                            promise.set_success(());
                        }
                        Err(e) => {
                            let err = Arc::new(KeelsonError::Io(e));
                            promise.set_shared_failure(Arc::clone(&err));
                            for (_, rest) in batch.by_ref() {
                                rest.set_shared_failure(Arc::clone(&err));
                            }
                            if let Some(events) = events.upgrade() {
                                events.on_write_error(gen, err);
                            }
                        }
                    }
                }
            }
            WriteCmd::Close => break,
        }
    }

    for (_, promise) in queued {
        promise.set_failure(KeelsonError::ChannelClosed);
    }
    trace!(channel = %gen, "write pump stopped");
}

/// A client channel before its connection is established.
pub(crate) struct TcpConnectTransport {
    gen: ChannelId,
    events: Weak<dyn IoEvents>,
    timeout: Option<Duration>,
}

impl TcpConnectTransport {
    pub(crate) fn new(gen: ChannelId, events: Weak<dyn IoEvents>, timeout: Option<Duration>) -> Self {
        Self { gen, events, timeout }
    }
}

impl Transport for TcpConnectTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn write(&self, _buf: ByteBuffer, promise: CompletionFuture) {
        promise.set_failure(KeelsonError::Unsupported("write before connect"));
    }

    fn flush(&self) {}

    fn close(&self) {}

    fn connect(&self, addr: SocketAddr, promise: CompletionFuture) {
        let (gen, events, timeout) = (self.gen, self.events.clone(), self.timeout);
        spawn_local(async move {
            let res = match timeout {
                Some(limit) => match compio::time::timeout(limit, TcpStream::connect(addr)).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                },
                None => TcpStream::connect(addr).await,
            };
            let Some(events) = events.upgrade() else {
                promise.set_failure(KeelsonError::ChannelClosed);
                return;
            };
            match res {
                Ok(stream) => events.on_connected(gen, stream, promise),
                Err(e) => events.on_op_failed(gen, KeelsonError::Io(e), promise),
            }
        });
    }
}

/// A listening socket and its accept loop.
pub(crate) struct TcpListenerTransport {
    gen: ChannelId,
    events: Weak<dyn IoEvents>,
    shared: Arc<ListenerShared>,
}

#[derive(Default)]
struct ListenerShared {
    local: Mutex<Option<SocketAddr>>,
    stop: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl TcpListenerTransport {
    pub(crate) fn new(gen: ChannelId, events: Weak<dyn IoEvents>) -> Self {
        Self {
            gen,
            events,
            shared: Arc::new(ListenerShared::default()),
        }
    }
}

impl Transport for TcpListenerTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local.lock()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn write(&self, _buf: ByteBuffer, promise: CompletionFuture) {
        promise.set_failure(KeelsonError::Unsupported("write on a listening channel"));
    }

    fn flush(&self) {}

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.stop.lock().take();
    }

    fn bind(&self, addr: SocketAddr, promise: CompletionFuture) {
        let (gen, events, shared) = (self.gen, self.events.clone(), Arc::clone(&self.shared));
        spawn_local(async move {
            let bound = TcpListener::bind(addr).await;
            let Some(owner) = events.upgrade() else {
                promise.set_failure(KeelsonError::ChannelClosed);
                return;
            };
            let listener = match bound {
                Ok(listener) => listener,
                Err(e) => {
                    owner.on_op_failed(gen, KeelsonError::Io(e), promise);
                    return;
                }
            };
            if shared.closed.load(Ordering::Acquire) {
                promise.set_failure(KeelsonError::ChannelClosed);
                return;
            }
            let local = listener.local_addr().ok();
            *shared.local.lock() = local;
            let (stop_tx, stop_rx) = flume::bounded::<()>(1);
            *shared.stop.lock() = Some(stop_tx);
            debug!(channel = %gen, addr = ?local, "listening");
            owner.on_bound(gen, promise);
            drop(owner);

            accept_loop(listener, gen, events, stop_rx).await;
        });
    }
}

async fn accept_loop(
    listener: TcpListener,
    gen: ChannelId,
    events: Weak<dyn IoEvents>,
    stop: Receiver<()>,
) {
    loop {
        let accepted = select! {
            _ = stop.recv_async().fuse() => break,
            res = listener.accept().fuse() => res,
        };
        let Some(owner) = events.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => {
                trace!(channel = %gen, %peer, "accepted");
                owner.on_child(gen, stream, peer);
            }
            Err(e) => {
                warn!(channel = %gen, error = %e, "accept failed");
                owner.on_accept_error(gen, KeelsonError::Io(e));
            }
        }
    }
    debug!(channel = %gen, "accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use compio::io::AsyncReadExt;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = futures::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn nodelay(stream: &TcpStream) -> bool {
        with_sock_ref(stream, |sock| sock.nodelay()).unwrap()
    }

    #[cfg(unix)]
    #[compio::test]
    async fn nodelay_follows_channel_options() {
        let (client, server) = connected_pair().await;
        configure_stream(&client, &ChannelOptions::default(), ChannelId(1));
        configure_stream(&server, &ChannelOptions::default().with_tcp_nodelay(false), ChannelId(2));
        assert!(nodelay(&client));
        assert!(!nodelay(&server));

        // the borrowed descriptor stays open
        let (mut reader, mut writer) = (client, server);
        let BufResult(res, _) = writer.write_all(b"ping".to_vec()).await;
        res.unwrap();
        let BufResult(res, buf) = reader.read_exact(Vec::with_capacity(4)).await;
        res.unwrap();
        assert_eq!(buf, b"ping");
    }
}
