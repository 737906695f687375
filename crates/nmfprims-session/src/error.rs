use std::time::Duration;

use nmfprims_frame::{FaultCode, FrameError};
use nmfprims_transport::TransportError;

/// Errors surfaced by session channels.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer broke the framing protocol, or a quota was exceeded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The operation's deadline elapsed. Callers may retry on a new channel.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// A previous operation faulted this channel.
    #[error("channel is faulted")]
    ChannelFaulted,

    /// The peer replied with a `Fault` record.
    #[error("peer sent fault: {0}")]
    Fault(FaultCode),

    /// The operation is not valid in the channel's current state.
    #[error("cannot {op} while channel is {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// An async write or shutdown was dropped before it finished, leaving a
    /// partial record on the wire.
    #[error("operation was cancelled mid-write")]
    Cancelled,

    /// An outbound message exceeds the configured send limit.
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::TimedOut(after) => Self::TimedOut(after),
            other => Self::Transport(other),
        }
    }
}

impl SessionError {
    /// Whether this error represents an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Whether the failure came from the peer violating the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
