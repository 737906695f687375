//! Record writers.
//!
//! Clients use these for the preamble and outbound envelopes; test peers and
//! servers use them to produce replies.

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::record::{FaultCode, KnownEncoding, Mode, QuotaField, Quotas, RecordType, VERSION};
use crate::varint::{encode_varint, varint_len};

/// Default chunk size for unsized envelope bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Message encoding announced in the preamble.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageEncoding {
    Known(KnownEncoding),
    /// Content type sent in an `ExtensibleEncoding` record.
    Extensible(String),
}

impl Default for MessageEncoding {
    fn default() -> Self {
        Self::Known(KnownEncoding::BinarySession)
    }
}

/// The records a client sends before its first envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientPreamble {
    pub mode: Mode,
    pub via: String,
    pub encoding: MessageEncoding,
}

impl ClientPreamble {
    pub fn new(mode: Mode, via: impl Into<String>, encoding: MessageEncoding) -> Self {
        Self {
            mode,
            via: via.into(),
            encoding,
        }
    }

    /// Encode `Version Mode Via Encoding PreambleEnd` into `dst`.
    ///
    /// `Via` and extensible content types are checked against `quotas`
    /// before anything is written.
    pub fn encode(&self, quotas: &Quotas, dst: &mut BytesMut) -> Result<()> {
        check_quota(QuotaField::Via, &self.via, quotas.max_via)?;
        if let MessageEncoding::Extensible(content_type) = &self.encoding {
            check_quota(
                QuotaField::ContentType,
                content_type,
                quotas.max_content_type,
            )?;
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(RecordType::Version.as_byte());
        dst.put_u8(VERSION.0);
        dst.put_u8(VERSION.1);
        dst.put_u8(RecordType::Mode.as_byte());
        dst.put_u8(self.mode as u8);
        dst.put_u8(RecordType::Via.as_byte());
        put_string(&self.via, dst);
        match &self.encoding {
            MessageEncoding::Known(encoding) => {
                dst.put_u8(RecordType::KnownEncoding.as_byte());
                dst.put_u8(*encoding as u8);
            }
            MessageEncoding::Extensible(content_type) => {
                dst.put_u8(RecordType::ExtensibleEncoding.as_byte());
                put_string(content_type, dst);
            }
        }
        dst.put_u8(RecordType::PreambleEnd.as_byte());
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        let encoding = match &self.encoding {
            MessageEncoding::Known(_) => 2,
            MessageEncoding::Extensible(ct) => 1 + string_len(ct),
        };
        3 + 2 + 1 + string_len(&self.via) + encoding + 1
    }
}

fn string_len(value: &str) -> usize {
    varint_len(value.len() as u32) + value.len()
}

fn check_quota(field: QuotaField, value: &str, quota: u32) -> Result<()> {
    if value.len() > quota as usize {
        return Err(FrameError::QuotaExceeded {
            field,
            size: value.len() as u64,
            max: u64::from(quota),
        });
    }
    Ok(())
}

/// Caller has checked `value.len()` fits the field's quota (and so a u32).
fn put_string(value: &str, dst: &mut BytesMut) {
    encode_varint(value.len() as u32, dst);
    dst.put_slice(value.as_bytes());
}

/// Write `[VarInt length][bytes]` for `value`, enforcing `quota`.
pub fn encode_quota_string(
    field: QuotaField,
    value: &str,
    quota: u32,
    dst: &mut BytesMut,
) -> Result<()> {
    check_quota(field, value, quota)?;
    put_string(value, dst);
    Ok(())
}

/// Write a record that carries no payload.
pub fn write_record(record: RecordType, dst: &mut BytesMut) {
    dst.put_u8(record.as_byte());
}

pub fn write_preamble_ack(dst: &mut BytesMut) {
    write_record(RecordType::PreambleAck, dst);
}

pub fn write_end(dst: &mut BytesMut) {
    write_record(RecordType::End, dst);
}

pub fn write_upgrade_response(dst: &mut BytesMut) {
    write_record(RecordType::UpgradeResponse, dst);
}

pub fn write_upgrade_request(content_type: &str, quotas: &Quotas, dst: &mut BytesMut) -> Result<()> {
    check_quota(
        QuotaField::UpgradeContentType,
        content_type,
        quotas.max_upgrade_content_type,
    )?;
    write_record(RecordType::UpgradeRequest, dst);
    put_string(content_type, dst);
    Ok(())
}

pub fn write_fault(fault: &FaultCode, dst: &mut BytesMut) -> Result<()> {
    let fault = fault.to_fault_string();
    check_quota(QuotaField::Fault, &fault, u32::MAX)?;
    write_record(RecordType::Fault, dst);
    put_string(&fault, dst);
    Ok(())
}

/// Write `SizedEnvelope [VarInt size][body]`.
pub fn write_sized_envelope(body: &[u8], dst: &mut BytesMut) -> Result<()> {
    let size = envelope_size(body.len())?;
    dst.reserve(1 + varint_len(size) + body.len());
    write_record(RecordType::SizedEnvelope, dst);
    encode_varint(size, dst);
    dst.put_slice(body);
    Ok(())
}

/// Write `UnsizedEnvelope` followed by the body in chunks of at most
/// `chunk_size` bytes and the terminating empty chunk. A `chunk_size` of
/// zero selects [`DEFAULT_CHUNK_SIZE`].
pub fn write_unsized_envelope(body: &[u8], chunk_size: usize, dst: &mut BytesMut) -> Result<()> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let chunk_size = envelope_size(chunk_size)? as usize;
    write_record(RecordType::UnsizedEnvelope, dst);
    for chunk in body.chunks(chunk_size) {
        encode_varint(chunk.len() as u32, dst);
        dst.put_slice(chunk);
    }
    encode_varint(0, dst);
    Ok(())
}

fn envelope_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| FrameError::QuotaExceeded {
        field: QuotaField::Envelope,
        size: len as u64,
        max: u64::from(u32::MAX),
    })
}
