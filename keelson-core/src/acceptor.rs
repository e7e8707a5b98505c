//! Accept side of a listening channel.
//!
//! The acceptor turns each accepted stream into a child channel on the
//! listener's event loop:
//! - child table: every open child by id, so closing the listener closes
//!   them all;
//! - reuse pool: closed children kept for the next connection, reused only
//!   once nothing outside the pool holds them;
//! - initializer: run once per child (or per reuse) to build its pipeline.

use crate::buffer::ByteBuffer;
use crate::channel::{Channel, ChannelId, PipelineMessage};
use crate::error::Result;
use crate::executor::EventExecutor;
use crate::future::CompletionFuture;
use crate::options::ChannelOptions;
use crate::transport::{configure_stream, TcpTransport, Transport};

use compio::net::TcpStream;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Builds the pipeline of a freshly accepted child.
pub type ChildInitializer<M> = Arc<dyn Fn(&Channel<M>) -> Result<()> + Send + Sync>;

pub struct Acceptor<M: PipelineMessage = ByteBuffer> {
    me: Weak<Self>,
    executor: Arc<dyn EventExecutor>,
    initializer: ChildInitializer<M>,
    child_options: ChannelOptions,
    children: Mutex<HashMap<ChannelId, Channel<M>>>,
    pool: Mutex<Vec<Channel<M>>>,
    accepting: AtomicBool,
}

impl<M: PipelineMessage> Acceptor<M> {
    pub(crate) fn new(
        executor: Arc<dyn EventExecutor>,
        initializer: ChildInitializer<M>,
        child_options: ChannelOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            executor,
            initializer,
            child_options,
            children: Mutex::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn child_options(&self) -> &ChannelOptions {
        &self.child_options
    }

    /// Number of open children.
    #[must_use]
    pub fn live_children(&self) -> usize {
        self.children.lock().len()
    }

    /// Number of closed children waiting for reuse.
    #[must_use]
    pub fn pooled_children(&self) -> usize {
        self.pool.lock().len()
    }

    /// Snapshot of the open children.
    #[must_use]
    pub fn children(&self) -> Vec<Channel<M>> {
        self.children.lock().values().cloned().collect()
    }

    /// Wrap an accepted stream in a child channel and start it. Runs on the
    /// listener's loop.
    pub(crate) fn accept(&self, server: &Channel<M>, stream: TcpStream, peer: SocketAddr) {
        if !self.accepting.load(Ordering::Acquire) {
            trace!(channel = %server.id(), %peer, "not accepting, connection dropped");
            return;
        }
        let read_size = self.child_options.read_buffer_size;
        let child = match self.take_pooled() {
            Some(child) => {
                let id = child.reset_for_reuse();
                configure_stream(&stream, &self.child_options, id);
                let transport = TcpTransport::start(stream, id, child.events(), read_size);
                child.install_transport(Arc::new(transport));
                child
            }
            None => {
                let options = self.child_options.clone();
                Channel::create(
                    Arc::clone(&self.executor),
                    self.child_options.clone(),
                    Some(server),
                    move |id, events| -> Arc<dyn Transport> {
                        configure_stream(&stream, &options, id);
                        Arc::new(TcpTransport::start(stream, id, events, read_size))
                    },
                )
            }
        };

        let id = child.id();
        self.children.lock().insert(id, child.clone());
        let acceptor = self.me.clone();
        child.close_future().add_listener(move |_| {
            if let Some(acceptor) = acceptor.upgrade() {
                acceptor.release(id);
            }
        });

        if let Err(e) = (self.initializer)(&child) {
            warn!(channel = %id, error = %e, "child initializer failed");
            child.pipeline().fire_exception_caught(Arc::new(e));
            let _ = child.close();
            return;
        }

        debug!(channel = %id, parent = %server.id(), %peer, "child accepted");
        child.pipeline().fire_channel_created();
        server.pipeline().fire_child_accepted(child.clone());
        child.activate();
    }

    fn take_pooled(&self) -> Option<Channel<M>> {
        let mut pool = self.pool.lock();
        let index = pool.iter().position(Channel::is_unique)?;
        Some(pool.swap_remove(index))
    }

    /// A child's close future resolved.
    fn release(&self, id: ChannelId) {
        let Some(child) = self.children.lock().remove(&id) else {
            return;
        };
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < self.child_options.child_pool_capacity {
            trace!(channel = %id, "child pooled");
            pool.push(child);
        }
    }

    /// Stop accepting, empty the pool and close every child. Returns the
    /// children's close futures.
    pub(crate) fn close_children(&self) -> Vec<CompletionFuture> {
        self.accepting.store(false, Ordering::Release);
        self.pool.lock().clear();
        let children = self.children();
        debug!(children = children.len(), "closing children");
        children.iter().map(Channel::close).collect()
    }
}
