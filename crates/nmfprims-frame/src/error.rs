use crate::record::{QuotaField, RecordType};

/// The specific protocol rule a malformed stream broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedKind {
    /// A record of the wrong type arrived for the current state.
    #[error("expected record {expected}, found 0x{found:02x}")]
    UnexpectedRecord { expected: RecordType, found: u8 },

    /// The peer answered the preamble with something that looks like HTTP.
    #[error(
        "expected {expected}, found what looks like an HTTP response; \
         the endpoint may not speak the framing protocol"
    )]
    HttpResponse { expected: RecordType },

    /// A decode call was made after the stream reached `End` or a fault.
    #[error("data received after the framing stream ended")]
    FramingAtEnd,

    /// A decode call was made after the record handed its body to the
    /// envelope decoder.
    #[error("envelope body must be read through the envelope decoder")]
    EnvelopeHandedOff,

    /// A VarInt ran past five bytes or overflowed 32 bits.
    #[error("variable-length integer too large")]
    FrameTooLarge,

    /// A quota string held bytes that are not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// The stream ended in the middle of a record.
    #[error("stream ended inside a record")]
    UnexpectedEof,

    /// A message arrived while waiting for the peer to end its session.
    #[error("message received while closing the input session")]
    UnexpectedMessageOnClose,

    /// Bytes arrived after the peer's `End` record during close.
    #[error("{0} unexpected bytes received while draining on close")]
    UnexpectedDataOnClose(usize),
}

/// Errors produced while decoding or encoding records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The stream broke a protocol rule. Carries the decoder state and the
    /// stream offset at which it happened.
    #[error("malformed frame in state {state} at offset {offset}: {kind}")]
    Malformed {
        kind: MalformedKind,
        state: &'static str,
        offset: u64,
    },

    /// A declared length exceeded its configured quota.
    #[error("{field} quota exceeded: {size} bytes (max {max})")]
    QuotaExceeded { field: QuotaField, size: u64, max: u64 },

    /// A decoded value was read before completion, or decoding continued
    /// after the value was complete.
    #[error("decoded value not available")]
    ValueNotAvailable,
}

impl FrameError {
    pub fn malformed(kind: MalformedKind, state: &'static str, offset: u64) -> Self {
        Self::Malformed {
            kind,
            state,
            offset,
        }
    }

    /// The violated rule, if this is a malformed-frame error.
    pub fn malformed_kind(&self) -> Option<&MalformedKind> {
        match self {
            Self::Malformed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
