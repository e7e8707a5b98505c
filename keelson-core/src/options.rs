//! Channel configuration options
//!
//! Per-channel knobs applied by the bootstraps when channels are created.

use crate::error::{KeelsonError, Result};
use std::time::Duration;

/// Channel configuration options.
///
/// # Examples
///
/// ```
/// use keelson_core::options::ChannelOptions;
///
/// let opts = ChannelOptions::default()
///     .with_read_buffer_size(16 * 1024)
///     .with_child_pool_capacity(128);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Read buffer size (bytes)
    ///
    /// Size of the buffer handed to each socket read.
    /// - Default: 8192 (8KB) - balanced for most workloads
    /// - Small: 4096 (4KB) - for low-latency with small messages
    /// - Large: 16384 (16KB) - for high-throughput with large messages
    pub read_buffer_size: usize,

    /// Disable Nagle's algorithm on accepted and connected sockets (TCP_NODELAY)
    ///
    /// - Default: true
    pub tcp_nodelay: bool,

    /// Closed child channels kept by an acceptor for reuse
    ///
    /// - Default: 64
    /// - 0: never pool, every accepted connection gets a fresh channel
    pub child_pool_capacity: usize,

    /// Bytes reserved in front of buffers from `Channel::alloc_buffer`
    ///
    /// Lets encoders prepend a header without copying the payload.
    /// - Default: 16
    pub prepend_reserve: usize,

    /// Connection timeout
    ///
    /// Maximum time a client bootstrap waits for the TCP handshake.
    /// - Default: None (use OS default)
    pub connect_timeout: Option<Duration>,

    /// Refuse blocking waits on this channel's futures from its own loop
    ///
    /// - Default: true
    /// - The process-wide switch `future::set_deadlock_check` overrides it
    pub deadlock_check: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192, // 8KB - balanced default
            tcp_nodelay: true,
            child_pool_capacity: 64,
            prepend_reserve: 16,
            connect_timeout: None,
            deadlock_check: true,
        }
    }
}

impl ChannelOptions {
    /// Create new channel options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Small reads, no pooling headroom: favors latency over throughput.
    #[must_use]
    pub fn low_latency() -> Self {
        Self::default().with_read_buffer_size(4096)
    }

    /// Large reads and a deep reuse pool for busy servers.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self::default()
            .with_read_buffer_size(16384)
            .with_child_pool_capacity(1024)
    }

    /// Set read buffer size.
    ///
    /// # Examples
    ///
    /// ```
    /// use keelson_core::options::ChannelOptions;
    ///
    /// let opts = ChannelOptions::new().with_read_buffer_size(4096);
    /// assert_eq!(opts.read_buffer_size, 4096);
    /// ```
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set how many closed child channels an acceptor keeps for reuse.
    #[must_use]
    pub fn with_child_pool_capacity(mut self, capacity: usize) -> Self {
        self.child_pool_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_prepend_reserve(mut self, bytes: usize) -> Self {
        self.prepend_reserve = bytes;
        self
    }

    /// Set connection timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_deadlock_check(mut self, enabled: bool) -> Self {
        self.deadlock_check = enabled;
        self
    }

    /// Reject values no channel can run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(KeelsonError::invalid_config("read_buffer_size must be > 0"));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(KeelsonError::invalid_config(
                "connect_timeout must be > 0 (use None for the OS default)",
            ));
        }
        Ok(())
    }
}
