//! Transport-independent inbound logic.
//!
//! The blocking and async channels share these types and differ only in how
//! they wait for the connection to fill a [`RecvBuffer`].

use std::ops::{Deref, DerefMut};

use bytes::{Buf, Bytes, BytesMut};
use nmfprims_frame::{
    ClientDuplexDecoder, ClientSingletonDecoder, DuplexState, FaultCode, FrameError,
    FramingDecoder, MalformedKind, Pooled, Quotas, SingletonEnvelopeDecoder,
    SingletonEnvelopeState, SingletonState,
};

use crate::ops::Done;

/// Bytes received from the connection and not yet decoded.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    buf: Pooled<BytesMut>,
    read_size: usize,
}

impl RecvBuffer {
    pub(crate) fn new(buf: Pooled<BytesMut>, read_size: usize) -> Self {
        Self {
            buf,
            read_size: read_size.max(1),
        }
    }

    /// Space for the next transport read.
    ///
    /// Only bytes passed to [`ReadWindow::commit`] stay in the buffer; a
    /// window dropped without a commit, including one held by a cancelled
    /// read, leaves the buffer as it was.
    pub(crate) fn read_window(&mut self) -> ReadWindow<'_> {
        let filled = self.buf.len();
        self.buf.resize(filled + self.read_size, 0);
        ReadWindow { recv: self, filled }
    }

    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Writable tail of a [`RecvBuffer`], trimmed back to the received bytes
/// on drop.
#[derive(Debug)]
pub(crate) struct ReadWindow<'a> {
    recv: &'a mut RecvBuffer,
    filled: usize,
}

impl ReadWindow<'_> {
    /// Keep the first `n` bytes of the window.
    pub(crate) fn commit(mut self, n: usize) {
        self.filled += n.min(self.recv.read_size);
    }
}

impl Deref for ReadWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.recv.buf[self.filled..]
    }
}

impl DerefMut for ReadWindow<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.recv.buf[self.filled..]
    }
}

impl Drop for ReadWindow<'_> {
    fn drop(&mut self) {
        self.recv.buf.truncate(self.filled);
    }
}

/// What the duplex inbound core found in the received bytes.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    /// Decoding needs more bytes from the connection.
    NeedData,
    PreambleAck,
    Message(Bytes),
    /// The peer sent `End`.
    End,
    Fault(FaultCode),
}

/// Drives a [`ClientDuplexDecoder`] over a [`RecvBuffer`] and reassembles
/// envelope bodies. Zero-length envelopes are not delivered.
#[derive(Debug)]
pub(crate) struct InboundCore {
    decoder: ClientDuplexDecoder,
    recv: RecvBuffer,
    body: BytesMut,
    in_envelope: bool,
}

impl InboundCore {
    pub(crate) fn new(quotas: &Quotas, recv: RecvBuffer) -> Self {
        Self {
            decoder: ClientDuplexDecoder::new(quotas),
            recv,
            body: BytesMut::new(),
            in_envelope: false,
        }
    }

    pub(crate) fn recv(&mut self) -> &mut RecvBuffer {
        &mut self.recv
    }

    /// Bytes received but not decoded.
    pub(crate) fn buffered(&self) -> usize {
        self.recv.len()
    }

    pub(crate) fn next_event(&mut self) -> Result<Inbound, FrameError> {
        loop {
            let before = self.decoder.state();
            if self.recv.is_empty() && !before.is_announcement() && !before.is_terminal() {
                return Ok(Inbound::NeedData);
            }
            let pending = self.recv.pending();
            let n = self.decoder.decode(pending)?;
            if before == DuplexState::ReadingEnvelopeBytes {
                self.body.extend_from_slice(&pending[..n]);
            }
            self.recv.consume(n);

            match self.decoder.state() {
                DuplexState::Start => return Ok(Inbound::PreambleAck),
                DuplexState::EnvelopeStart => {
                    self.in_envelope = true;
                    self.body.reserve(self.decoder.envelope_size() as usize);
                }
                DuplexState::EnvelopeEnd if before != DuplexState::EnvelopeEnd => {
                    if self.in_envelope {
                        self.in_envelope = false;
                        return Ok(Inbound::Message(self.body.split().freeze()));
                    }
                }
                DuplexState::End => return Ok(Inbound::End),
                DuplexState::Fault => {
                    let fault = self
                        .decoder
                        .fault()
                        .cloned()
                        .unwrap_or_else(|| FaultCode::Other(String::new()));
                    return Ok(Inbound::Fault(fault));
                }
                _ => {}
            }
        }
    }

    /// Next event, or `None` when the connection must be read first.
    /// `done` reports the last connection call; a zero-byte read is end of
    /// stream in the middle of a record.
    pub(crate) fn poll(&mut self, done: Done) -> Result<Option<Inbound>, FrameError> {
        if done == Done::Read(0) {
            return Err(self.eof_error());
        }
        match self.next_event()? {
            Inbound::NeedData => Ok(None),
            event => Ok(Some(event)),
        }
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.decoder.state_name()
    }

    /// Error for a connection that reached end of stream mid-record.
    pub(crate) fn eof_error(&self) -> FrameError {
        FrameError::malformed(
            MalformedKind::UnexpectedEof,
            self.decoder.state_name(),
            self.decoder.stream_position(),
        )
    }
}

/// What a singleton exchange found in the received bytes.
#[derive(Debug, PartialEq)]
pub(crate) enum SingletonInbound {
    NeedData,
    PreambleAck,
    /// Reply body followed by `End`.
    Reply(Bytes),
    /// `End` with no reply envelope.
    End,
    Fault(FaultCode),
}

/// Drives the singleton decoder pair over a [`RecvBuffer`].
#[derive(Debug)]
pub(crate) struct SingletonCore {
    decoders: Pooled<(ClientSingletonDecoder, SingletonEnvelopeDecoder)>,
    recv: RecvBuffer,
    body: BytesMut,
    acked: bool,
}

impl SingletonCore {
    pub(crate) fn new(
        decoders: Pooled<(ClientSingletonDecoder, SingletonEnvelopeDecoder)>,
        recv: RecvBuffer,
    ) -> Self {
        Self {
            decoders,
            recv,
            body: BytesMut::new(),
            acked: false,
        }
    }

    pub(crate) fn recv(&mut self) -> &mut RecvBuffer {
        &mut self.recv
    }

    pub(crate) fn buffered(&self) -> usize {
        self.recv.len()
    }

    pub(crate) fn next_event(&mut self) -> Result<SingletonInbound, FrameError> {
        loop {
            let (preamble, envelope) = &mut *self.decoders;
            if preamble.state() == SingletonState::EnvelopeStart {
                let before = envelope.state();
                if before == SingletonEnvelopeState::End {
                    return Ok(SingletonInbound::Reply(self.body.split().freeze()));
                }
                if self.recv.is_empty() && !before.is_announcement() {
                    return Ok(SingletonInbound::NeedData);
                }
                let pending = self.recv.pending();
                let n = envelope.decode(pending)?;
                if before == SingletonEnvelopeState::ReadingEnvelopeBytes {
                    self.body.extend_from_slice(&pending[..n]);
                }
                self.recv.consume(n);
                continue;
            }

            let before = preamble.state();
            if self.recv.is_empty() && !before.is_announcement() && !before.is_final() {
                return Ok(SingletonInbound::NeedData);
            }
            let n = preamble.decode(self.recv.pending())?;
            self.recv.consume(n);

            match preamble.state() {
                SingletonState::Start if !self.acked => {
                    self.acked = true;
                    return Ok(SingletonInbound::PreambleAck);
                }
                SingletonState::End => return Ok(SingletonInbound::End),
                SingletonState::Fault => {
                    let fault = preamble
                        .fault()
                        .cloned()
                        .unwrap_or_else(|| FaultCode::Other(String::new()));
                    return Ok(SingletonInbound::Fault(fault));
                }
                _ => {}
            }
        }
    }

    /// Same contract as [`InboundCore::poll`].
    pub(crate) fn poll(&mut self, done: Done) -> Result<Option<SingletonInbound>, FrameError> {
        if done == Done::Read(0) {
            return Err(self.eof_error());
        }
        match self.next_event()? {
            SingletonInbound::NeedData => Ok(None),
            event => Ok(Some(event)),
        }
    }

    /// Name of whichever decoder is currently consuming bytes.
    pub(crate) fn state_name(&self) -> &'static str {
        let (preamble, envelope) = &*self.decoders;
        if preamble.state() == SingletonState::EnvelopeStart {
            envelope.state_name()
        } else {
            preamble.state_name()
        }
    }

    pub(crate) fn eof_error(&self) -> FrameError {
        let (preamble, envelope) = &*self.decoders;
        if preamble.state() == SingletonState::EnvelopeStart {
            FrameError::malformed(
                MalformedKind::UnexpectedEof,
                envelope.state_name(),
                preamble.stream_position() + envelope.stream_position(),
            )
        } else {
            FrameError::malformed(
                MalformedKind::UnexpectedEof,
                preamble.state_name(),
                preamble.stream_position(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nmfprims_frame::{
        write_end, write_fault, write_preamble_ack, write_sized_envelope, write_unsized_envelope,
        BufferPool, Pool,
    };

    use super::*;

    fn recv_buffer() -> RecvBuffer {
        let pool = Arc::new(BufferPool::with_buffer_size(64, 4));
        RecvBuffer::new(pool.take(), 16)
    }

    fn feed(recv: &mut RecvBuffer, bytes: &[u8]) {
        let mut window = recv.read_window();
        let n = bytes.len().min(window.len());
        window[..n].copy_from_slice(&bytes[..n]);
        window.commit(n);
    }

    /// Feed `bytes` in `read_size` pieces, collecting events until `End` or
    /// a fault.
    fn drain_duplex(bytes: &[u8]) -> Vec<Inbound> {
        let mut core = InboundCore::new(&Quotas::default(), recv_buffer());
        let mut rest = bytes;
        let mut events = Vec::new();
        loop {
            match core.next_event().unwrap() {
                Inbound::NeedData => {
                    assert!(!rest.is_empty(), "ran out of input");
                    let n = rest.len().min(16);
                    feed(core.recv(), &rest[..n]);
                    rest = &rest[n..];
                }
                event @ (Inbound::End | Inbound::Fault(_)) => {
                    events.push(event);
                    return events;
                }
                event => events.push(event),
            }
        }
    }

    #[test]
    fn read_window_commit_keeps_only_received_bytes() {
        let mut recv = recv_buffer();
        feed(&mut recv, b"abc");
        feed(&mut recv, b"de");
        assert_eq!(recv.pending(), b"abcde");
        recv.consume(2);
        assert_eq!(recv.pending(), b"cde");
    }

    #[test]
    fn dropped_window_leaves_buffer_untouched() {
        let mut recv = recv_buffer();
        feed(&mut recv, b"hel");
        {
            let mut window = recv.read_window();
            window[..2].copy_from_slice(b"zz");
        }
        assert_eq!(recv.pending(), b"hel");
        feed(&mut recv, b"lo");
        assert_eq!(recv.pending(), b"hello");
    }

    #[test]
    fn poll_reports_eof_mid_record() {
        let mut core = InboundCore::new(&Quotas::default(), recv_buffer());
        feed(core.recv(), &[0x0B, 0x06, 0x03, b'a']);
        assert_eq!(core.poll(Done::Start).unwrap(), Some(Inbound::PreambleAck));
        assert_eq!(core.poll(Done::Start).unwrap(), None);
        let err = core.poll(Done::Read(0)).unwrap_err();
        assert_eq!(err.malformed_kind(), Some(&MalformedKind::UnexpectedEof));
    }

    #[test]
    fn duplex_messages_span_reads() {
        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        write_sized_envelope(&[1u8; 40], &mut wire).unwrap();
        write_sized_envelope(b"", &mut wire).unwrap();
        write_sized_envelope(b"second", &mut wire).unwrap();
        write_end(&mut wire);

        let events = drain_duplex(&wire);
        assert_eq!(
            events,
            vec![
                Inbound::PreambleAck,
                Inbound::Message(Bytes::from(vec![1u8; 40])),
                Inbound::Message(Bytes::from_static(b"second")),
                Inbound::End,
            ]
        );
    }

    #[test]
    fn duplex_fault_is_reported() {
        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        write_fault(&FaultCode::ServerTooBusy, &mut wire).unwrap();
        let events = drain_duplex(&wire);
        assert_eq!(
            events,
            vec![Inbound::PreambleAck, Inbound::Fault(FaultCode::ServerTooBusy)]
        );
    }

    #[test]
    fn bytes_after_end_stay_buffered() {
        let mut core = InboundCore::new(&Quotas::default(), recv_buffer());
        feed(core.recv(), &[0x0B, 0x07, 0xAA]);
        assert_eq!(core.next_event().unwrap(), Inbound::PreambleAck);
        assert_eq!(core.next_event().unwrap(), Inbound::End);
        assert_eq!(core.buffered(), 1);
    }

    #[test]
    fn eof_error_names_decoder_state() {
        let mut core = InboundCore::new(&Quotas::default(), recv_buffer());
        feed(core.recv(), &[0x0B, 0x06, 0x05, b'h']);
        assert_eq!(core.next_event().unwrap(), Inbound::PreambleAck);
        assert_eq!(core.next_event().unwrap(), Inbound::NeedData);
        let err = core.eof_error();
        assert_eq!(
            err,
            FrameError::malformed(MalformedKind::UnexpectedEof, "ReadingEnvelopeBytes", 4)
        );
    }

    #[test]
    fn singleton_reply_is_reassembled() {
        let quotas = Quotas::default();
        let pool = Arc::new(Pool::new(1, move || {
            (
                ClientSingletonDecoder::new(&quotas),
                SingletonEnvelopeDecoder::new(&quotas),
            )
        }));
        let mut core = SingletonCore::new(pool.take(), recv_buffer());

        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        write_unsized_envelope(b"reply body spanning reads", 7, &mut wire).unwrap();
        write_end(&mut wire);

        let mut rest = &wire[..];
        let mut events = Vec::new();
        loop {
            match core.next_event().unwrap() {
                SingletonInbound::NeedData => {
                    let n = rest.len().min(5);
                    feed(core.recv(), &rest[..n]);
                    rest = &rest[n..];
                }
                event @ SingletonInbound::Reply(_) => {
                    events.push(event);
                    break;
                }
                event => events.push(event),
            }
        }
        assert_eq!(
            events,
            vec![
                SingletonInbound::PreambleAck,
                SingletonInbound::Reply(Bytes::from_static(b"reply body spanning reads")),
            ]
        );
        assert!(rest.is_empty());
        assert_eq!(core.buffered(), 0);
    }
}
