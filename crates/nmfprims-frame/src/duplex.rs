use crate::decoder::{DecoderCore, FaultReader, FramingDecoder};
use crate::error::{FrameError, MalformedKind, Result};
use crate::record::{FaultCode, QuotaField, Quotas, RecordType};
use crate::varint::VarIntDecoder;

/// States of [`ClientDuplexDecoder`].
///
/// `UpgradeResponse`, `Start`, `EnvelopeStart` and `EnvelopeEnd` are
/// announcement states: the caller observes them after a step, and the next
/// step leaves them without consuming input. `End` and `Fault` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexState {
    ReadingUpgradeRecord,
    UpgradeResponse,
    ReadingAckRecord,
    Start,
    ReadingFault,
    Fault,
    ReadingEnvelopeRecord,
    ReadingEnvelopeSize,
    EnvelopeStart,
    ReadingEnvelopeBytes,
    EnvelopeEnd,
    End,
}

impl DuplexState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingUpgradeRecord => "ReadingUpgradeRecord",
            Self::UpgradeResponse => "UpgradeResponse",
            Self::ReadingAckRecord => "ReadingAckRecord",
            Self::Start => "Start",
            Self::ReadingFault => "ReadingFault",
            Self::Fault => "Fault",
            Self::ReadingEnvelopeRecord => "ReadingEnvelopeRecord",
            Self::ReadingEnvelopeSize => "ReadingEnvelopeSize",
            Self::EnvelopeStart => "EnvelopeStart",
            Self::ReadingEnvelopeBytes => "ReadingEnvelopeBytes",
            Self::EnvelopeEnd => "EnvelopeEnd",
            Self::End => "End",
        }
    }

    /// True for states left by the next step without consuming input.
    pub fn is_announcement(self) -> bool {
        matches!(
            self,
            Self::UpgradeResponse | Self::Start | Self::EnvelopeStart | Self::EnvelopeEnd
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Fault)
    }
}

/// Client-side decoder for the duplex session grammar:
///
/// ```text
/// (UpgradeResponse upgrade-bytes)* (PreambleAck | Fault)
///     ((SizedEnvelope size bytes) | Fault)* End
/// ```
///
/// While the decoder is in [`DuplexState::ReadingEnvelopeBytes`], the bytes a
/// step consumes are envelope body bytes; the decoder itself never buffers
/// them. A `SizedEnvelope` of size zero moves straight to `EnvelopeEnd`
/// without an `EnvelopeStart`.
#[derive(Debug, Clone)]
pub struct ClientDuplexDecoder {
    core: DecoderCore,
    state: DuplexState,
    size: VarIntDecoder,
    fault_reader: FaultReader,
    max_envelope: u32,
    envelope_size: u32,
    bytes_needed: u32,
    fault: Option<FaultCode>,
}

impl ClientDuplexDecoder {
    pub fn new(quotas: &Quotas) -> Self {
        Self {
            core: DecoderCore::new(),
            state: DuplexState::ReadingUpgradeRecord,
            size: VarIntDecoder::new(),
            fault_reader: FaultReader::new(quotas.max_fault),
            max_envelope: quotas.max_envelope,
            envelope_size: 0,
            bytes_needed: 0,
            fault: None,
        }
    }

    pub fn state(&self) -> DuplexState {
        self.state
    }

    /// Declared size of the envelope being read.
    pub fn envelope_size(&self) -> u32 {
        self.envelope_size
    }

    /// Body bytes of the current envelope not yet consumed.
    pub fn envelope_bytes_needed(&self) -> u32 {
        self.bytes_needed
    }

    /// The peer's fault, once the decoder is in [`DuplexState::Fault`].
    pub fn fault(&self) -> Option<&FaultCode> {
        self.fault.as_ref()
    }

    /// Skip the upgrade phase. Used when the preamble was acknowledged
    /// before this decoder took over the stream.
    pub fn start_after_ack(&mut self) {
        self.state = DuplexState::Start;
    }

    fn step(&mut self, buf: &[u8]) -> Result<usize> {
        let state_name = self.state.name();
        match self.state {
            DuplexState::ReadingUpgradeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::UpgradeResponse.as_byte() {
                    self.state = DuplexState::UpgradeResponse;
                    Ok(1)
                } else {
                    self.state = DuplexState::ReadingAckRecord;
                    Ok(0)
                }
            }
            DuplexState::UpgradeResponse => {
                self.state = DuplexState::ReadingUpgradeRecord;
                Ok(0)
            }
            DuplexState::ReadingAckRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::Fault.as_byte() {
                    self.begin_fault();
                    return Ok(1);
                }
                self.core.validate_preamble_ack(byte, state_name)?;
                self.state = DuplexState::Start;
                Ok(1)
            }
            DuplexState::Start | DuplexState::EnvelopeEnd => {
                self.state = DuplexState::ReadingEnvelopeRecord;
                Ok(0)
            }
            DuplexState::ReadingFault => {
                let (consumed, fault) = self.fault_reader.decode(&self.core, buf, state_name)?;
                if let Some(fault) = fault {
                    self.fault = Some(fault);
                    self.state = DuplexState::Fault;
                }
                Ok(consumed)
            }
            DuplexState::ReadingEnvelopeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(0);
                };
                if byte == RecordType::End.as_byte() {
                    self.state = DuplexState::End;
                    return Ok(1);
                }
                if byte == RecordType::Fault.as_byte() {
                    self.begin_fault();
                    return Ok(1);
                }
                self.core
                    .validate_record(RecordType::SizedEnvelope, byte, state_name)?;
                self.size.reset();
                self.state = DuplexState::ReadingEnvelopeSize;
                Ok(1)
            }
            DuplexState::ReadingEnvelopeSize => {
                let consumed = self
                    .size
                    .decode(buf)
                    .map_err(|err| self.core.contextualize(err, state_name))?;
                if self.size.is_done() {
                    let size = self.size.value()?;
                    if size > self.max_envelope {
                        return Err(FrameError::QuotaExceeded {
                            field: QuotaField::Envelope,
                            size: u64::from(size),
                            max: u64::from(self.max_envelope),
                        });
                    }
                    self.envelope_size = size;
                    self.bytes_needed = size;
                    self.state = if size == 0 {
                        DuplexState::EnvelopeEnd
                    } else {
                        DuplexState::EnvelopeStart
                    };
                }
                Ok(consumed)
            }
            DuplexState::EnvelopeStart => {
                self.state = DuplexState::ReadingEnvelopeBytes;
                Ok(0)
            }
            DuplexState::ReadingEnvelopeBytes => {
                let take = buf.len().min(self.bytes_needed as usize);
                // `take` is bounded by `bytes_needed`, which is a u32.
                self.bytes_needed -= take as u32;
                if self.bytes_needed == 0 {
                    self.state = DuplexState::EnvelopeEnd;
                }
                Ok(take)
            }
            DuplexState::End | DuplexState::Fault => Err(self
                .core
                .malformed(MalformedKind::FramingAtEnd, state_name)),
        }
    }

    fn begin_fault(&mut self) {
        self.fault_reader.reset();
        self.state = DuplexState::ReadingFault;
    }
}

impl FramingDecoder for ClientDuplexDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        let consumed = self.step(buf)?;
        self.core.advance(consumed);
        Ok(consumed)
    }

    fn reset(&mut self) {
        self.core.reset();
        self.state = DuplexState::ReadingUpgradeRecord;
        self.size.reset();
        self.fault_reader.reset();
        self.envelope_size = 0;
        self.bytes_needed = 0;
        self.fault = None;
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn stream_position(&self) -> u64 {
        self.core.position()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use proptest::prelude::*;

    use super::*;
    use crate::encoder::{write_end, write_fault, write_preamble_ack, write_sized_envelope};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Upgrade,
        Ack,
        Envelope(Vec<u8>),
        EmptyEnvelope,
        Fault(FaultCode),
        End,
    }

    /// Feed `chunks` in order and collect the record events they produce,
    /// along with the total bytes consumed.
    fn run<'a>(
        decoder: &mut ClientDuplexDecoder,
        chunks: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(Vec<Event>, usize)> {
        let mut events = Vec::new();
        let mut body = Vec::new();
        let mut in_envelope = false;
        let mut total = 0;
        for mut chunk in chunks {
            loop {
                let before = decoder.state();
                if before.is_terminal() || (chunk.is_empty() && !before.is_announcement()) {
                    break;
                }
                let n = decoder.decode(chunk)?;
                if before == DuplexState::ReadingEnvelopeBytes {
                    body.extend_from_slice(&chunk[..n]);
                }
                chunk = &chunk[n..];
                total += n;
                match decoder.state() {
                    DuplexState::UpgradeResponse => events.push(Event::Upgrade),
                    DuplexState::Start => events.push(Event::Ack),
                    DuplexState::EnvelopeStart => in_envelope = true,
                    DuplexState::EnvelopeEnd if before != DuplexState::EnvelopeEnd => {
                        if in_envelope {
                            events.push(Event::Envelope(std::mem::take(&mut body)));
                            in_envelope = false;
                        } else {
                            events.push(Event::EmptyEnvelope);
                        }
                    }
                    DuplexState::Fault => {
                        events.push(Event::Fault(decoder.fault().cloned().unwrap()))
                    }
                    DuplexState::End => events.push(Event::End),
                    _ => {}
                }
            }
        }
        Ok((events, total))
    }

    fn stream(build: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        build(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn ack_envelope_empty_envelope_end() {
        let bytes = stream(|b| {
            write_preamble_ack(b);
            write_sized_envelope(b"hello", b).unwrap();
            write_sized_envelope(b"", b).unwrap();
            write_end(b);
        });
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let (events, consumed) = run(&mut decoder, [bytes.as_slice()]).unwrap();

        assert_eq!(consumed, bytes.len());
        assert_eq!(
            events,
            vec![
                Event::Ack,
                Event::Envelope(b"hello".to_vec()),
                Event::EmptyEnvelope,
                Event::End,
            ]
        );
        let envelopes = events
            .iter()
            .filter(|e| matches!(e, Event::Envelope(_)))
            .count();
        assert_eq!(envelopes, 1);
    }

    #[test]
    fn unsized_envelope_after_ack_is_rejected() {
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let (events, _) = run(&mut decoder, [&[0x0B][..]]).unwrap();
        assert_eq!(events, vec![Event::Ack]);
        assert_eq!(decoder.state(), DuplexState::ReadingEnvelopeRecord);

        let err = decoder.decode(&[0x05]).unwrap_err();
        match err {
            FrameError::Malformed {
                kind: MalformedKind::UnexpectedRecord { expected, found },
                state,
                offset,
            } => {
                assert_eq!(expected, RecordType::SizedEnvelope);
                assert_eq!(found, 0x05);
                assert_eq!(state, "ReadingEnvelopeRecord");
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_after_end_is_framing_at_end() {
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        run(&mut decoder, [&[0x0B, 0x07][..]]).unwrap();
        assert_eq!(decoder.state(), DuplexState::End);

        for input in [&[][..], &[0x06, 0x01][..]] {
            let err = decoder.decode(input).unwrap_err();
            assert_eq!(err.malformed_kind(), Some(&MalformedKind::FramingAtEnd));
        }
    }

    #[test]
    fn fault_instead_of_ack() {
        let bytes = stream(|b| write_fault(&FaultCode::EndpointNotFound, b).unwrap());
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let (events, consumed) = run(&mut decoder, [bytes.as_slice()]).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(events, vec![Event::Fault(FaultCode::EndpointNotFound)]);

        let err = decoder.decode(&[0x07]).unwrap_err();
        assert_eq!(err.malformed_kind(), Some(&MalformedKind::FramingAtEnd));
    }

    #[test]
    fn fault_between_envelopes() {
        let bytes = stream(|b| {
            write_preamble_ack(b);
            write_sized_envelope(b"one", b).unwrap();
            write_fault(&FaultCode::ServerTooBusy, b).unwrap();
        });
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let (events, _) = run(&mut decoder, [bytes.as_slice()]).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Ack,
                Event::Envelope(b"one".to_vec()),
                Event::Fault(FaultCode::ServerTooBusy),
            ]
        );
    }

    #[test]
    fn upgrade_responses_precede_ack() {
        let bytes = [0x0A, 0x0A, 0x0B, 0x07];
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let (events, _) = run(&mut decoder, [&bytes[..]]).unwrap();
        assert_eq!(
            events,
            vec![Event::Upgrade, Event::Upgrade, Event::Ack, Event::End]
        );
    }

    #[test]
    fn http_reply_is_reported() {
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let err = run(&mut decoder, [&b"HTTP/1.1 400 Bad Request"[..]]).unwrap_err();
        assert!(matches!(
            err.malformed_kind(),
            Some(MalformedKind::HttpResponse { .. })
        ));
    }

    #[test]
    fn oversized_envelope_is_quota_error() {
        let quotas = Quotas {
            max_envelope: 4,
            ..Quotas::default()
        };
        let bytes = stream(|b| {
            write_preamble_ack(b);
            write_sized_envelope(b"too long", b).unwrap();
        });
        let mut decoder = ClientDuplexDecoder::new(&quotas);
        let err = run(&mut decoder, [bytes.as_slice()]).unwrap_err();
        assert_eq!(
            err,
            FrameError::QuotaExceeded {
                field: QuotaField::Envelope,
                size: 8,
                max: 4,
            }
        );
    }

    #[test]
    fn oversized_fault_string_is_quota_error() {
        let quotas = Quotas {
            max_fault: 8,
            ..Quotas::default()
        };
        let bytes = stream(|b| write_fault(&FaultCode::EndpointUnavailable, b).unwrap());
        let mut decoder = ClientDuplexDecoder::new(&quotas);
        let err = run(&mut decoder, [bytes.as_slice()]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::QuotaExceeded {
                field: QuotaField::Fault,
                max: 8,
                ..
            }
        ));
    }

    #[test]
    fn varint_overflow_carries_stream_offset() {
        let mut bytes = vec![0x0B, 0x06];
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        let err = run(&mut decoder, [bytes.as_slice()]).unwrap_err();
        assert_eq!(
            err,
            FrameError::malformed(MalformedKind::FrameTooLarge, "ReadingEnvelopeSize", 6)
        );
    }

    #[test]
    fn reset_reuses_decoder() {
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        run(&mut decoder, [&[0x0B, 0x07][..]]).unwrap();
        decoder.reset();
        assert_eq!(decoder.state(), DuplexState::ReadingUpgradeRecord);
        assert_eq!(decoder.stream_position(), 0);
        let (events, _) = run(&mut decoder, [&[0x0B, 0x07][..]]).unwrap();
        assert_eq!(events, vec![Event::Ack, Event::End]);
    }

    #[test]
    fn start_after_ack_skips_preamble_phase() {
        let mut decoder = ClientDuplexDecoder::new(&Quotas::default());
        decoder.start_after_ack();
        let mut bytes = BytesMut::new();
        write_sized_envelope(b"x", &mut bytes).unwrap();
        bytes.put_u8(0x07);
        let (events, _) = run(&mut decoder, [&bytes[..]]).unwrap();
        assert_eq!(events, vec![Event::Envelope(b"x".to_vec()), Event::End]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..5),
            cuts in proptest::collection::vec(1usize..40, 1..20),
        ) {
            let bytes = stream(|b| {
                write_preamble_ack(b);
                for body in &bodies {
                    write_sized_envelope(body, b).unwrap();
                }
                write_end(b);
            });

            let mut whole = ClientDuplexDecoder::new(&Quotas::default());
            let expected = run(&mut whole, [bytes.as_slice()]).unwrap();

            let mut pieces = Vec::new();
            let mut rest = bytes.as_slice();
            let mut cut = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = (*cut.next().unwrap()).min(rest.len());
                pieces.push(&rest[..n]);
                rest = &rest[n..];
            }
            let mut split = ClientDuplexDecoder::new(&Quotas::default());
            let actual = run(&mut split, pieces).unwrap();

            prop_assert_eq!(&expected, &actual);
            prop_assert_eq!(expected.1, bytes.len());
            prop_assert_eq!(whole.stream_position(), split.stream_position());
        }
    }
}
