//! Decoders for the singleton (request/reply) grammar:
//!
//! ```text
//! (UpgradeResponse upgrade-bytes)* (PreambleAck | Fault) (UnsizedEnvelope | Fault) End
//! ```
//!
//! [`ClientSingletonDecoder`] reads up to the start of the reply envelope and
//! then hands the stream to a [`SingletonEnvelopeDecoder`], which reads the
//! chunked body and the closing `End` record.

use crate::decoder::{DecoderCore, FaultReader, FramingDecoder};
use crate::error::{FrameError, MalformedKind, Result};
use crate::record::{FaultCode, QuotaField, Quotas, RecordType};
use crate::varint::VarIntDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonState {
    ReadingUpgradeRecord,
    UpgradeResponse,
    ReadingAckRecord,
    Start,
    ReadingFault,
    Fault,
    ReadingEnvelopeRecord,
    /// The reply body follows; continue with a [`SingletonEnvelopeDecoder`].
    EnvelopeStart,
    End,
}

impl SingletonState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingUpgradeRecord => "ReadingUpgradeRecord",
            Self::UpgradeResponse => "UpgradeResponse",
            Self::ReadingAckRecord => "ReadingAckRecord",
            Self::Start => "Start",
            Self::ReadingFault => "ReadingFault",
            Self::Fault => "Fault",
            Self::ReadingEnvelopeRecord => "ReadingEnvelopeRecord",
            Self::EnvelopeStart => "EnvelopeStart",
            Self::End => "End",
        }
    }

    pub fn is_announcement(self) -> bool {
        matches!(self, Self::UpgradeResponse | Self::Start)
    }

    /// States after which this decoder accepts no more input.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Fault | Self::EnvelopeStart | Self::End)
    }
}

/// Client-side decoder for the singleton preamble reply and envelope start.
#[derive(Debug, Clone)]
pub struct ClientSingletonDecoder {
    core: DecoderCore,
    state: SingletonState,
    fault_reader: FaultReader,
    fault: Option<FaultCode>,
}

impl ClientSingletonDecoder {
    pub fn new(quotas: &Quotas) -> Self {
        Self {
            core: DecoderCore::new(),
            state: SingletonState::ReadingUpgradeRecord,
            fault_reader: FaultReader::new(quotas.max_fault),
            fault: None,
        }
    }

    pub fn state(&self) -> SingletonState {
        self.state
    }

    pub fn fault(&self) -> Option<&FaultCode> {
        self.fault.as_ref()
    }

    /// Skip the upgrade and ack phase.
    pub fn start_after_ack(&mut self) {
        self.state = SingletonState::Start;
    }

    fn step(&mut self, buf: &[u8]) -> Result<usize> {
        let state_name = self.state.name();
        match self.state {
            SingletonState::ReadingUpgradeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::UpgradeResponse.as_byte() {
                    self.state = SingletonState::UpgradeResponse;
                    Ok(1)
                } else {
                    self.state = SingletonState::ReadingAckRecord;
                    Ok(0)
                }
            }
            SingletonState::UpgradeResponse => {
                self.state = SingletonState::ReadingUpgradeRecord;
                Ok(0)
            }
            SingletonState::ReadingAckRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::Fault.as_byte() {
                    self.begin_fault();
                    return Ok(1);
                }
                self.core.validate_preamble_ack(byte, state_name)?;
                self.state = SingletonState::Start;
                Ok(1)
            }
            SingletonState::Start => {
                self.state = SingletonState::ReadingEnvelopeRecord;
                Ok(0)
            }
            SingletonState::ReadingFault => {
                let (consumed, fault) = self.fault_reader.decode(&self.core, buf, state_name)?;
                if let Some(fault) = fault {
                    self.fault = Some(fault);
                    self.state = SingletonState::Fault;
                }
                Ok(consumed)
            }
            SingletonState::ReadingEnvelopeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::End.as_byte() {
                    self.state = SingletonState::End;
                    return Ok(1);
                }
                if byte == RecordType::Fault.as_byte() {
                    self.begin_fault();
                    return Ok(1);
                }
                self.core
                    .validate_record(RecordType::UnsizedEnvelope, byte, state_name)?;
                self.state = SingletonState::EnvelopeStart;
                Ok(1)
            }
            SingletonState::EnvelopeStart => Err(self
                .core
                .malformed(MalformedKind::EnvelopeHandedOff, state_name)),
            SingletonState::End | SingletonState::Fault => Err(self
                .core
                .malformed(MalformedKind::FramingAtEnd, state_name)),
        }
    }

    fn begin_fault(&mut self) {
        self.fault_reader.reset();
        self.state = SingletonState::ReadingFault;
    }
}

impl FramingDecoder for ClientSingletonDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        let consumed = self.step(buf)?;
        self.core.advance(consumed);
        Ok(consumed)
    }

    fn reset(&mut self) {
        self.core.reset();
        self.state = SingletonState::ReadingUpgradeRecord;
        self.fault_reader.reset();
        self.fault = None;
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn stream_position(&self) -> u64 {
        self.core.position()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonEnvelopeState {
    ReadingEnvelopeChunkSize,
    ChunkStart,
    ReadingEnvelopeBytes,
    ChunkEnd,
    /// The empty chunk was read; an `End` record must follow.
    EnvelopeEnd,
    End,
}

impl SingletonEnvelopeState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingEnvelopeChunkSize => "ReadingEnvelopeChunkSize",
            Self::ChunkStart => "ChunkStart",
            Self::ReadingEnvelopeBytes => "ReadingEnvelopeBytes",
            Self::ChunkEnd => "ChunkEnd",
            Self::EnvelopeEnd => "EnvelopeEnd",
            Self::End => "End",
        }
    }

    pub fn is_announcement(self) -> bool {
        matches!(self, Self::ChunkStart | Self::ChunkEnd)
    }
}

/// Reads the chunked body of an `UnsizedEnvelope` and the `End` record that
/// closes a singleton reply.
///
/// Bytes consumed in [`SingletonEnvelopeState::ReadingEnvelopeBytes`] are body
/// bytes. The running total across chunks is held to the envelope quota.
#[derive(Debug, Clone)]
pub struct SingletonEnvelopeDecoder {
    core: DecoderCore,
    state: SingletonEnvelopeState,
    size: VarIntDecoder,
    max_envelope: u32,
    chunk_size: u32,
    bytes_needed: u32,
    total: u64,
}

impl SingletonEnvelopeDecoder {
    pub fn new(quotas: &Quotas) -> Self {
        Self {
            core: DecoderCore::new(),
            state: SingletonEnvelopeState::ReadingEnvelopeChunkSize,
            size: VarIntDecoder::new(),
            max_envelope: quotas.max_envelope,
            chunk_size: 0,
            bytes_needed: 0,
            total: 0,
        }
    }

    pub fn state(&self) -> SingletonEnvelopeState {
        self.state
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Body bytes of the current chunk not yet consumed.
    pub fn chunk_bytes_needed(&self) -> u32 {
        self.bytes_needed
    }

    /// Body bytes announced so far across all chunks.
    pub fn envelope_size(&self) -> u64 {
        self.total
    }

    fn step(&mut self, buf: &[u8]) -> Result<usize> {
        let state_name = self.state.name();
        match self.state {
            SingletonEnvelopeState::ReadingEnvelopeChunkSize => {
                let consumed = self
                    .size
                    .decode(buf)
                    .map_err(|err| self.core.contextualize(err, state_name))?;
                if self.size.is_done() {
                    let size = self.size.value()?;
                    self.size.reset();
                    if size == 0 {
                        self.state = SingletonEnvelopeState::EnvelopeEnd;
                        return Ok(consumed);
                    }
                    let total = self.total + u64::from(size);
                    if total > u64::from(self.max_envelope) {
                        return Err(FrameError::QuotaExceeded {
                            field: QuotaField::Envelope,
                            size: total,
                            max: u64::from(self.max_envelope),
                        });
                    }
                    self.total = total;
                    self.chunk_size = size;
                    self.bytes_needed = size;
                    self.state = SingletonEnvelopeState::ChunkStart;
                }
                Ok(consumed)
            }
            SingletonEnvelopeState::ChunkStart => {
                self.state = SingletonEnvelopeState::ReadingEnvelopeBytes;
                Ok(0)
            }
            SingletonEnvelopeState::ReadingEnvelopeBytes => {
                let take = buf.len().min(self.bytes_needed as usize);
                self.bytes_needed -= take as u32;
                if self.bytes_needed == 0 {
                    self.state = SingletonEnvelopeState::ChunkEnd;
                }
                Ok(take)
            }
            SingletonEnvelopeState::ChunkEnd => {
                self.state = SingletonEnvelopeState::ReadingEnvelopeChunkSize;
                Ok(0)
            }
            SingletonEnvelopeState::EnvelopeEnd => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                self.core.validate_record(RecordType::End, byte, state_name)?;
                self.state = SingletonEnvelopeState::End;
                Ok(1)
            }
            SingletonEnvelopeState::End => Err(self
                .core
                .malformed(MalformedKind::FramingAtEnd, state_name)),
        }
    }
}

impl FramingDecoder for SingletonEnvelopeDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        let consumed = self.step(buf)?;
        self.core.advance(consumed);
        Ok(consumed)
    }

    fn reset(&mut self) {
        self.core.reset();
        self.state = SingletonEnvelopeState::ReadingEnvelopeChunkSize;
        self.size.reset();
        self.chunk_size = 0;
        self.bytes_needed = 0;
        self.total = 0;
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn stream_position(&self) -> u64 {
        self.core.position()
    }
}
