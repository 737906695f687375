//! Incremental record decoding for the message framing protocol.
//!
//! Every record on the wire starts with a one-byte record type, followed by
//! a type-specific payload:
//! - nothing (`PreambleAck`, `End`, `UpgradeResponse`, ...)
//! - a quota-limited, VarInt-prefixed UTF-8 string (`Via`, `Fault`, ...)
//! - a VarInt-prefixed envelope body (`SizedEnvelope`)
//! - a sequence of VarInt-prefixed chunks closed by an empty chunk
//!   (`UnsizedEnvelope`)
//!
//! The decoders in this crate are pull-based state machines. They accept
//! whatever bytes have arrived, report how many they consumed, and keep
//! their exact progress between calls, so a message never has to be buffered
//! whole before it can be parsed.

pub mod cache;
pub mod decoder;
pub mod duplex;
pub mod encoder;
pub mod error;
pub mod pool;
pub mod record;
pub mod singleton;
pub mod string;
pub mod varint;

pub use cache::BoundedCache;
pub use decoder::{DecoderCore, FramingDecoder};
pub use duplex::{ClientDuplexDecoder, DuplexState};
pub use encoder::{
    encode_quota_string, write_end, write_fault, write_preamble_ack, write_record,
    write_sized_envelope, write_unsized_envelope, write_upgrade_request, write_upgrade_response,
    ClientPreamble, MessageEncoding, DEFAULT_CHUNK_SIZE,
};
pub use error::{FrameError, MalformedKind, Result};
pub use pool::{BufferPool, Pool, Pooled, Recycle};
pub use record::{FaultCode, KnownEncoding, Mode, QuotaField, Quotas, RecordType, VERSION};
pub use singleton::{
    ClientSingletonDecoder, SingletonEnvelopeDecoder, SingletonEnvelopeState, SingletonState,
};
pub use string::{QuotaStringDecoder, StringState};
pub use varint::{encode_varint, varint_len, VarIntDecoder, MAX_VARINT_LEN};
