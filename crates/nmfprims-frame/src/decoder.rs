//! Shared pieces of the client frame decoders.

use crate::error::{FrameError, MalformedKind, Result};
use crate::record::{FaultCode, QuotaField, RecordType};
use crate::string::QuotaStringDecoder;

/// Common capability of the client frame decoders.
///
/// `decode` performs one state-machine step over the bytes offered and
/// returns how many it consumed; a step may consume zero bytes when it only
/// moves between states. Callers loop, inspecting the decoder state between
/// steps. `reset` returns the decoder to its initial state but keeps any
/// scratch allocations.
pub trait FramingDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<usize>;
    fn reset(&mut self);
    fn state_name(&self) -> &'static str;
    /// Total bytes consumed since construction or the last reset.
    fn stream_position(&self) -> u64;
}

/// Byte-offset tracking and record validation shared by every decoder.
#[derive(Debug, Clone, Default)]
pub struct DecoderCore {
    position: u64,
}

impl DecoderCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn advance(&mut self, consumed: usize) {
        self.position += consumed as u64;
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn malformed(&self, kind: MalformedKind, state: &'static str) -> FrameError {
        FrameError::malformed(kind, state, self.position)
    }

    /// Re-anchor an error raised by a nested decoder at this stream's
    /// position and state. Offsets reported by nested decoders are relative
    /// to the current step.
    pub fn contextualize(&self, err: FrameError, state: &'static str) -> FrameError {
        match err {
            FrameError::Malformed { kind, offset, .. } => {
                FrameError::malformed(kind, state, self.position + offset)
            }
            other => other,
        }
    }

    /// Check `found` against the single record type legal in `state`.
    pub fn validate_record(
        &self,
        expected: RecordType,
        found: u8,
        state: &'static str,
    ) -> Result<()> {
        if found == expected.as_byte() {
            Ok(())
        } else {
            Err(self.malformed(MalformedKind::UnexpectedRecord { expected, found }, state))
        }
    }

    /// Like [`validate_record`](Self::validate_record) for the preamble ack,
    /// with a clearer error when the peer is speaking HTTP.
    pub fn validate_preamble_ack(&self, found: u8, state: &'static str) -> Result<()> {
        if found == RecordType::PreambleAck.as_byte() {
            return Ok(());
        }
        if found == b'h' || found == b'H' {
            return Err(self.malformed(
                MalformedKind::HttpResponse {
                    expected: RecordType::PreambleAck,
                },
                state,
            ));
        }
        Err(self.malformed(
            MalformedKind::UnexpectedRecord {
                expected: RecordType::PreambleAck,
                found,
            },
            state,
        ))
    }
}

/// Reads the quota string carried by a `Fault` record.
#[derive(Debug, Clone)]
pub(crate) struct FaultReader {
    string: QuotaStringDecoder,
}

impl FaultReader {
    pub(crate) fn new(max_fault: u32) -> Self {
        Self {
            string: QuotaStringDecoder::new(QuotaField::Fault, max_fault),
        }
    }

    /// One step of the fault string. Returns bytes consumed and, once the
    /// string is complete, the parsed fault.
    pub(crate) fn decode(
        &mut self,
        core: &DecoderCore,
        buf: &[u8],
        state: &'static str,
    ) -> Result<(usize, Option<FaultCode>)> {
        let consumed = self
            .string
            .decode(buf)
            .map_err(|err| core.contextualize(err, state))?;
        if !self.string.is_done() {
            return Ok((consumed, None));
        }
        let fault = FaultCode::parse(self.string.value()?);
        tracing::debug!(%fault, offset = core.position(), "fault record received");
        Ok((consumed, Some(fault)))
    }

    pub(crate) fn reset(&mut self) {
        self.string.reset();
    }
}
