/// Keelson Error Types
///
/// One taxonomy for buffers, futures, channels and codecs.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for keelson operations
#[derive(Error, Debug)]
pub enum KeelsonError {
    /// Buffer index or length outside the accessible window
    #[error("index out of range: index {index}, length {length}, capacity {capacity}")]
    IndexOutOfBounds {
        index: usize,
        length: usize,
        capacity: usize,
    },

    /// Growth requested past the buffer's maximum capacity
    #[error("capacity exceeded: requested {requested} bytes (max: {max})")]
    CapacityExceeded { requested: usize, max: usize },

    /// Shrinking would cut off bytes the buffer still holds
    #[error("invalid capacity {requested}: writer index is {writer_index}")]
    InvalidCapacity {
        requested: usize,
        writer_index: usize,
    },

    /// Prepend needs more room than is reserved in front of the reader index
    #[error("insufficient prepend space: need {needed} bytes, have {available}")]
    InsufficientPrependSpace { needed: usize, available: usize },

    /// Composite components must agree on byte order
    #[error("byte order mismatch between composite components")]
    ByteOrderMismatch,

    /// A length or header field resolves to an impossible frame
    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    /// Frame longer than the configured maximum (reported, not fatal)
    #[error("frame too long: {length} bytes (max: {max})")]
    FrameTooLong { length: u64, max: usize },

    /// OS-level bind / accept / connect / read / write failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Operation on a channel that has already been closed
    #[error("channel closed")]
    ChannelClosed,

    /// Operation the channel's transport does not support
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A completion listener panicked
    #[error("listener panicked: {0}")]
    ListenerPanicked(String),

    /// Blocking wait issued from the event loop thread that must resolve it
    #[error("blocking wait on the event loop thread would dead-lock")]
    BlockingInEventLoop,

    /// Future was cancelled before it resolved
    #[error("operation cancelled")]
    Cancelled,

    /// Failure cause shared by every observer of a future
    #[error("{0}")]
    Failed(Arc<KeelsonError>),

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for keelson operations
pub type Result<T> = std::result::Result<T, KeelsonError>;

impl KeelsonError {
    /// Create a corrupted-frame error with a message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::CorruptedFrame(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) const fn out_of_bounds(index: usize, length: usize, capacity: usize) -> Self {
        Self::IndexOutOfBounds {
            index,
            length,
            capacity,
        }
    }

    /// Decode-local errors never close the channel on their own.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CorruptedFrame(_) | Self::FrameTooLong { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Failed(inner) => inner.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Io(_) | Self::ChannelClosed => true,
            Self::Failed(inner) => inner.is_connection_error(),
            _ => false,
        }
    }

    /// Check if this is a buffer resource violation
    #[must_use]
    pub const fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::IndexOutOfBounds { .. }
                | Self::CapacityExceeded { .. }
                | Self::InvalidCapacity { .. }
                | Self::InsufficientPrependSpace { .. }
                | Self::ByteOrderMismatch
        )
    }
}
