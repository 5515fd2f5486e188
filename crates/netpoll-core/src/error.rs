//! Error types for netpoll

use std::io;
use std::time::Duration;

/// Errors surfaced by connections, dialers, listeners and the event loop.
#[derive(Debug, thiserror::Error)]
pub enum NetpollError {
    /// Connect did not complete before the caller's deadline
    #[error("dial timeout after {0:?}")]
    DialTimeout(Duration),

    /// OS-level connect failure, carried verbatim (refused, unreachable, ...)
    #[error("dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Operation attempted on a connection that is closing or closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Fewer bytes buffered than requested. Poll again after more data arrives.
    #[error("insufficient data: need {need} bytes, {available} available")]
    InsufficientData { need: usize, available: usize },

    /// A caller-side wait for input expired
    #[error("read timeout after {0:?}")]
    ReadTimeout(Duration),

    /// The readiness backend refused the descriptor
    #[error("poller registration failed: {0}")]
    PollerRegistrationFailed(#[source] io::Error),

    /// Accept attempted on a closed listener
    #[error("listener closed")]
    ListenerClosed,

    /// Network name other than tcp/tcp4/tcp6/unix
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// Address could not be parsed or resolved
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// Shutdown deadline elapsed before every poller terminated
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// The event loop has already been shut down
    #[error("event loop is shut down")]
    EventLoopShutdown,

    /// Other OS error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetpollError {
    /// True for the "not yet" signal of buffered reads.
    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, NetpollError::InsufficientData { .. })
    }

    /// True if the error means the connection is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, NetpollError::ConnectionClosed)
    }

    /// Underlying errno, if the error came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NetpollError::Connect { source, .. } => source.raw_os_error(),
            NetpollError::PollerRegistrationFailed(e) => e.raw_os_error(),
            NetpollError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias for netpoll operations
pub type Result<T> = std::result::Result<T, NetpollError>;
