use super::Transport;
use crate::buffer::ByteBuffer;
use crate::error::KeelsonError;
use crate::future::CompletionFuture;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory transport that records flushed buffers instead of sending them.
#[derive(Default)]
pub struct EmbeddedTransport {
    unflushed: Mutex<Vec<(ByteBuffer, CompletionFuture)>>,
    outbound: Mutex<VecDeque<ByteBuffer>>,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl EmbeddedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next flushed buffer, oldest first.
    pub fn read_outbound(&self) -> Option<ByteBuffer> {
        self.outbound.lock().pop_front()
    }

    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for EmbeddedTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    fn write(&self, buf: ByteBuffer, promise: CompletionFuture) {
        if self.is_closed() {
            promise.set_failure(KeelsonError::ChannelClosed);
            return;
        }
        self.unflushed.lock().push((buf, promise));
    }

    fn flush(&self) {
        let batch = std::mem::take(&mut *self.unflushed.lock());
        let mut done = Vec::with_capacity(batch.len());
        {
            let mut outbound = self.outbound.lock();
            for (buf, promise) in batch {
                outbound.push_back(buf);
                done.push(promise);
            }
        }
        // resolve outside the locks: listeners may write again
        for promise in done {
            promise.set_success(());
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let batch = std::mem::take(&mut *self.unflushed.lock());
        for (_, promise) in batch {
            promise.set_failure(KeelsonError::ChannelClosed);
        }
    }

    fn bind(&self, addr: SocketAddr, promise: CompletionFuture) {
        *self.local.lock() = Some(addr);
        promise.set_success(());
    }

    fn connect(&self, addr: SocketAddr, promise: CompletionFuture) {
        *self.remote.lock() = Some(addr);
        promise.set_success(());
    }
}
