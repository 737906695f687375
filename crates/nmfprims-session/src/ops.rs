//! Session operations as I/O-free step machines.
//!
//! An operation never touches a connection. Each [`Operation::step`] call
//! reports what the last requested [`Io`] did and gets back the next one,
//! or the finished result. Decoding, state transitions and close checks all
//! happen here; the blocking and async channels each run one loop that
//! performs the requested calls.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nmfprims_frame::{
    write_end, write_sized_envelope, BufferPool, FrameError, MalformedKind, Pooled,
};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::inbound::{Inbound, InboundCore, RecvBuffer};
use crate::lifecycle::Lifecycle;
use crate::state::{SessionEvent, SessionState};

/// Connection call requested by an operation.
#[derive(Debug)]
pub(crate) enum Io<'a> {
    /// Write all of the buffer and flush.
    Write(&'a [u8]),
    /// Half-close our side.
    Shutdown,
    /// Read once into the buffer's read window.
    Read(&'a mut RecvBuffer),
}

/// Outcome of the last [`Io`], fed into the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Done {
    /// First step; no I/O yet.
    Start,
    Wrote,
    ShutDown,
    /// Bytes read. Zero is end of stream.
    Read(usize),
}

#[derive(Debug)]
pub(crate) enum Step<'a, T> {
    Io(Io<'a>),
    Done(T),
}

pub(crate) trait Operation {
    type Output;

    fn step(&mut self, done: Done) -> Result<Step<'_, Self::Output>>;
}

/// Reject a send before anything is written. A faulted channel reports
/// that first, whatever the message size.
pub(crate) fn check_send<C>(
    lifecycle: &Lifecycle<C>,
    config: &SessionConfig,
    message: &[u8],
) -> Result<()> {
    lifecycle.ensure("send", SessionState::can_send)?;
    if message.len() > config.max_message_size {
        return Err(SessionError::MessageTooLarge {
            size: message.len(),
            max: config.max_message_size,
        });
    }
    Ok(())
}

pub(crate) fn malformed_on_close(kind: MalformedKind) -> SessionError {
    SessionError::Frame(FrameError::malformed(kind, "Closing", 0))
}

/// An inbound event the decoder grammar rules out at this point.
pub(crate) fn unexpected(op: &'static str, state: &'static str) -> SessionError {
    SessionError::InvalidState { op, state }
}

/// Write the preamble, then wait for the acknowledgement.
pub(crate) struct Handshake<'a> {
    preamble: &'a [u8],
    inbound: &'a mut InboundCore,
    sent: bool,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(preamble: &'a [u8], inbound: &'a mut InboundCore) -> Self {
        Self {
            preamble,
            inbound,
            sent: false,
        }
    }
}

impl Operation for Handshake<'_> {
    type Output = ();

    fn step(&mut self, done: Done) -> Result<Step<'_, ()>> {
        if !self.sent {
            self.sent = true;
            return Ok(Step::Io(Io::Write(self.preamble)));
        }
        let Some(event) = self.inbound.poll(done)? else {
            return Ok(Step::Io(Io::Read(self.inbound.recv())));
        };
        match event {
            Inbound::PreambleAck => Ok(Step::Done(())),
            Inbound::Fault(code) => Err(SessionError::Fault(code)),
            _ => Err(unexpected("open", self.inbound.state_name())),
        }
    }
}

/// One message framed as a sized envelope.
pub(crate) struct SendMessage {
    frame: Pooled<BytesMut>,
    sent: bool,
}

impl SendMessage {
    pub(crate) fn new(buffers: &Arc<BufferPool>, message: &[u8]) -> Result<Self> {
        let mut frame = buffers.take();
        write_sized_envelope(message, &mut frame)?;
        Ok(Self { frame, sent: false })
    }
}

impl Operation for SendMessage {
    type Output = ();

    fn step(&mut self, _done: Done) -> Result<Step<'_, ()>> {
        if self.sent {
            return Ok(Step::Done(()));
        }
        self.sent = true;
        Ok(Step::Io(Io::Write(&self.frame)))
    }
}

/// Decode the next message. `None` means the peer ended its output.
pub(crate) struct Receive<'a, C> {
    lifecycle: &'a Lifecycle<C>,
    inbound: &'a mut InboundCore,
}

impl<'a, C> Receive<'a, C> {
    pub(crate) fn new(lifecycle: &'a Lifecycle<C>, inbound: &'a mut InboundCore) -> Self {
        Self { lifecycle, inbound }
    }
}

impl<C> Operation for Receive<'_, C> {
    type Output = Option<Bytes>;

    fn step(&mut self, done: Done) -> Result<Step<'_, Option<Bytes>>> {
        let Some(event) = self.inbound.poll(done)? else {
            return Ok(Step::Io(Io::Read(self.inbound.recv())));
        };
        match event {
            Inbound::Message(message) => Ok(Step::Done(Some(message))),
            Inbound::End => {
                debug!("peer ended its output session");
                self.lifecycle.apply("receive", SessionEvent::InputEnded)?;
                Ok(Step::Done(None))
            }
            Inbound::Fault(code) => Err(SessionError::Fault(code)),
            _ => Err(unexpected("receive", self.inbound.state_name())),
        }
    }
}

/// Write `End` and half-close, unless output is already closing.
///
/// Pooled connections stay usable, so they are not half-closed. Yields
/// `true` when input had already ended, so the connection can be released.
pub(crate) struct CloseOutput<'a, C> {
    lifecycle: &'a Lifecycle<C>,
    end: Pooled<BytesMut>,
}

impl<'a, C> CloseOutput<'a, C> {
    pub(crate) fn new(lifecycle: &'a Lifecycle<C>, buffers: &Arc<BufferPool>) -> Self {
        let mut end = buffers.take();
        write_end(&mut end);
        Self { lifecycle, end }
    }

    fn finish(&self) -> Result<Step<'_, bool>> {
        debug!("output session closed");
        let next = self
            .lifecycle
            .apply("close output", SessionEvent::OutputShutdown)?;
        Ok(Step::Done(next == SessionState::InputClosed))
    }
}

impl<C> Operation for CloseOutput<'_, C> {
    type Output = bool;

    fn step(&mut self, done: Done) -> Result<Step<'_, bool>> {
        match done {
            Done::Start => {
                if !self.lifecycle.state().can_send() {
                    return Ok(Step::Done(false));
                }
                self.lifecycle
                    .apply("close output", SessionEvent::BeginOutputClose)?;
                Ok(Step::Io(Io::Write(&self.end)))
            }
            Done::Wrote if !self.lifecycle.is_pooled() => Ok(Step::Io(Io::Shutdown)),
            _ => self.finish(),
        }
    }
}

/// Finish the input side of a close: wait for the peer's `End` if it has
/// not arrived, check nothing follows it, drain to end of stream, then mark
/// the session released.
///
/// Yields `true` once the connection may be handed back or closed, `false`
/// when the session is not at that point (output still open, or another
/// caller already released it).
pub(crate) struct CloseInput<'a, C> {
    lifecycle: &'a Lifecycle<C>,
    inbound: &'a mut InboundCore,
    draining: bool,
}

impl<'a, C> CloseInput<'a, C> {
    pub(crate) fn new(lifecycle: &'a Lifecycle<C>, inbound: &'a mut InboundCore) -> Self {
        Self {
            lifecycle,
            inbound,
            draining: false,
        }
    }

    fn release(&self) -> Result<Step<'_, bool>> {
        self.lifecycle.apply("close", SessionEvent::Release)?;
        Ok(Step::Done(true))
    }
}

impl<C> Operation for CloseInput<'_, C> {
    type Output = bool;

    fn step(&mut self, done: Done) -> Result<Step<'_, bool>> {
        if self.draining {
            return match done {
                Done::Read(0) => self.release(),
                Done::Read(n) => Err(malformed_on_close(MalformedKind::UnexpectedDataOnClose(n))),
                _ => Ok(Step::Io(Io::Read(self.inbound.recv()))),
            };
        }

        match self.lifecycle.state() {
            SessionState::OutputClosed => {
                let Some(event) = self.inbound.poll(done)? else {
                    return Ok(Step::Io(Io::Read(self.inbound.recv())));
                };
                match event {
                    Inbound::End => {
                        self.lifecycle.apply("close", SessionEvent::InputEnded)?;
                    }
                    Inbound::Message(_) => {
                        return Err(malformed_on_close(MalformedKind::UnexpectedMessageOnClose))
                    }
                    Inbound::Fault(code) => return Err(SessionError::Fault(code)),
                    _ => return Err(unexpected("close", self.inbound.state_name())),
                }
            }
            SessionState::InputClosed => {}
            _ => return Ok(Step::Done(false)),
        }

        let trailing = self.inbound.buffered();
        if trailing > 0 {
            return Err(malformed_on_close(MalformedKind::UnexpectedDataOnClose(
                trailing,
            )));
        }
        if self.lifecycle.is_pooled() {
            return self.release();
        }
        self.draining = true;
        Ok(Step::Io(Io::Read(self.inbound.recv())))
    }
}

#[cfg(test)]
mod tests {
    use nmfprims_frame::{write_preamble_ack, Quotas};
    use nmfprims_transport::ConnectionPool;

    use super::*;
    use crate::lifecycle::PoolHandle;

    fn inbound() -> InboundCore {
        let buffers = Arc::new(BufferPool::with_buffer_size(64, 2));
        InboundCore::new(&Quotas::default(), RecvBuffer::new(buffers.take(), 32))
    }

    fn buffers() -> Arc<BufferPool> {
        Arc::new(BufferPool::with_buffer_size(64, 2))
    }

    /// Serve every read from `wire`, in pieces of at most `chunk` bytes.
    /// Writes and shutdowns are recorded by tag.
    fn run<O: Operation>(
        op: &mut O,
        mut wire: &[u8],
        chunk: usize,
    ) -> (Result<O::Output>, Vec<String>) {
        let mut calls = Vec::new();
        let mut done = Done::Start;
        loop {
            let step = match op.step(done) {
                Ok(step) => step,
                Err(err) => return (Err(err), calls),
            };
            done = match step {
                Step::Done(output) => return (Ok(output), calls),
                Step::Io(Io::Write(buf)) => {
                    calls.push(format!("write {buf:02x?}"));
                    Done::Wrote
                }
                Step::Io(Io::Shutdown) => {
                    calls.push("shutdown".to_string());
                    Done::ShutDown
                }
                Step::Io(Io::Read(recv)) => {
                    let mut window = recv.read_window();
                    let n = wire.len().min(chunk).min(window.len());
                    window[..n].copy_from_slice(&wire[..n]);
                    window.commit(n);
                    wire = &wire[n..];
                    calls.push(format!("read {n}"));
                    Done::Read(n)
                }
            };
        }
    }

    #[test]
    fn handshake_writes_preamble_then_reads_ack() {
        let mut core = inbound();
        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        let (result, calls) = run(&mut Handshake::new(&[0x00, 0x01, 0x00], &mut core), &wire, 8);
        result.unwrap();
        assert_eq!(calls, vec!["write [00, 01, 00]", "read 1"]);
    }

    #[test]
    fn handshake_eof_is_malformed() {
        let mut core = inbound();
        let (result, _) = run(&mut Handshake::new(&[0x0C], &mut core), &[], 8);
        let err = result.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn receive_applies_input_ended_on_end() {
        let lifecycle = Lifecycle::new((), None);
        let mut core = inbound();
        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        write_sized_envelope(b"abc", &mut wire).unwrap();
        write_end(&mut wire);

        let (result, _) = run(&mut Handshake::new(&[], &mut core), &wire[..1], 8);
        result.unwrap();
        let (result, _) = run(&mut Receive::new(&lifecycle, &mut core), &wire[1..], 2);
        assert_eq!(result.unwrap().as_deref(), Some(&b"abc"[..]));
        let (result, _) = run(&mut Receive::new(&lifecycle, &mut core), &[], 2);
        assert_eq!(result.unwrap(), None);
        assert_eq!(lifecycle.state(), SessionState::PeerClosed);
    }

    #[test]
    fn close_output_skips_shutdown_when_pooled() {
        let pool = Arc::new(ConnectionPool::new());
        let lifecycle = Lifecycle::new((), Some(PoolHandle::new(pool, "k")));
        let (result, calls) = run(&mut CloseOutput::new(&lifecycle, &buffers()), &[], 8);
        assert!(!result.unwrap());
        assert_eq!(calls, vec!["write [07]"]);
        assert_eq!(lifecycle.state(), SessionState::OutputClosed);
    }

    #[test]
    fn close_output_is_a_no_op_once_closing() {
        let lifecycle = Lifecycle::new((), None);
        let (result, calls) = run(&mut CloseOutput::new(&lifecycle, &buffers()), &[], 8);
        assert!(!result.unwrap());
        assert_eq!(calls, vec!["write [07]", "shutdown"]);

        let (result, calls) = run(&mut CloseOutput::new(&lifecycle, &buffers()), &[], 8);
        assert!(!result.unwrap());
        assert!(calls.is_empty());
    }

    #[test]
    fn close_input_waits_for_end_then_drains() {
        let lifecycle = Lifecycle::new((), None);
        lifecycle.apply("t", SessionEvent::BeginOutputClose).unwrap();
        lifecycle.apply("t", SessionEvent::OutputShutdown).unwrap();
        let mut core = inbound();
        let (result, _) = run(&mut Handshake::new(&[], &mut core), &[0x0B], 8);
        result.unwrap();

        let (result, calls) = run(&mut CloseInput::new(&lifecycle, &mut core), &[0x07], 8);
        assert!(result.unwrap());
        assert_eq!(calls, vec!["read 1", "read 0"]);
        assert_eq!(lifecycle.state(), SessionState::Closed);

        let (result, calls) = run(&mut CloseInput::new(&lifecycle, &mut core), &[], 8);
        assert!(!result.unwrap());
        assert!(calls.is_empty());
    }

    #[test]
    fn close_input_rejects_message_in_place_of_end() {
        let lifecycle = Lifecycle::new((), None);
        lifecycle.apply("t", SessionEvent::BeginOutputClose).unwrap();
        lifecycle.apply("t", SessionEvent::OutputShutdown).unwrap();
        let mut core = inbound();
        let mut wire = BytesMut::new();
        write_preamble_ack(&mut wire);
        write_sized_envelope(b"late", &mut wire).unwrap();
        let (result, _) = run(&mut Handshake::new(&[], &mut core), &wire[..1], 8);
        result.unwrap();

        let (result, _) = run(&mut CloseInput::new(&lifecycle, &mut core), &wire[1..], 8);
        match result.unwrap_err() {
            SessionError::Frame(frame) => assert_eq!(
                frame.malformed_kind(),
                Some(&MalformedKind::UnexpectedMessageOnClose)
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn close_input_does_nothing_while_output_open() {
        let lifecycle = Lifecycle::new((), None);
        let mut core = inbound();
        let (result, calls) = run(&mut CloseInput::new(&lifecycle, &mut core), &[0x07], 8);
        assert!(!result.unwrap());
        assert!(calls.is_empty());
        assert_eq!(lifecycle.state(), SessionState::Open);
    }

    #[test]
    fn check_send_reports_fault_before_size() {
        let lifecycle = Lifecycle::new((), None);
        let config = SessionConfig {
            max_message_size: 2,
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_send(&lifecycle, &config, b"abc"),
            Err(SessionError::MessageTooLarge { size: 3, max: 2 })
        ));
        lifecycle.fault(&SessionError::ChannelFaulted);
        assert!(matches!(
            check_send(&lifecycle, &config, b"abc"),
            Err(SessionError::ChannelFaulted)
        ));
    }
}
