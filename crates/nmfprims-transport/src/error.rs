use std::time::Duration;

use crate::traits::Side;

/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the specified address.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation's deadline elapsed before it completed.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The connection was aborted, possibly while this operation was in flight.
    #[error("connection aborted")]
    Aborted,

    /// The requested side of the connection has already been closed.
    #[error("connection closed")]
    Closed,

    /// A read or write was issued while another one on the same side was pending.
    #[error("a {0} is already pending on this connection")]
    Pending(Side),
}

impl TransportError {
    /// Whether this error represents an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
