//! One request, one reply, over singleton-unsized framing.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nmfprims_frame::{
    write_end, write_unsized_envelope, ClientSingletonDecoder, MalformedKind, Pool, Pooled,
    Quotas, SingletonEnvelopeDecoder,
};
#[cfg(feature = "async")]
use nmfprims_transport::AsyncConnection;
use nmfprims_transport::Connection;
use tracing::{debug, warn};

#[cfg(feature = "async")]
use crate::async_channel;
use crate::channel::{drive, ChannelOptions};
use crate::deadline::Deadline;
use crate::error::{Result, SessionError};
use crate::inbound::{RecvBuffer, SingletonCore, SingletonInbound};
use crate::ops::{malformed_on_close, unexpected, Done, Io, Operation, Step};

/// Decoder pair used for one singleton exchange.
pub type SingletonDecoders = (ClientSingletonDecoder, SingletonEnvelopeDecoder);

/// Recycled decoder state shared by every singleton channel of a factory.
pub type SingletonStatePool = Pool<SingletonDecoders>;

/// Pool of decoder pairs built for `quotas`, keeping at most `max_idle`.
pub fn singleton_state_pool(quotas: Quotas, max_idle: usize) -> Arc<SingletonStatePool> {
    Arc::new(Pool::new(max_idle, move || {
        (
            ClientSingletonDecoder::new(&quotas),
            SingletonEnvelopeDecoder::new(&quotas),
        )
    }))
}

/// A single request/reply exchange over a [`Connection`].
///
/// `request` consumes the channel. On success the connection goes back to
/// its pool (or is closed); on any failure it is aborted.
pub struct SingletonRequestChannel<C: Connection> {
    connection: C,
    options: ChannelOptions<C>,
    states: Arc<SingletonStatePool>,
}

impl<C: Connection> SingletonRequestChannel<C> {
    /// `options` should carry a singleton preamble, see
    /// [`ChannelOptions::singleton`].
    pub fn new(connection: C, options: ChannelOptions<C>, states: Arc<SingletonStatePool>) -> Self {
        Self {
            connection,
            options,
            states,
        }
    }

    /// Send `message` and wait for the reply. `Ok(None)` means the peer
    /// ended the session without replying.
    pub fn request(self, message: &[u8], timeout: Duration) -> Result<Option<Bytes>> {
        let Self {
            connection,
            options,
            states,
        } = self;
        let deadline = Deadline::after(timeout);
        let mut exchange = Exchange::new(&options, &states, message)?;

        let result = drive(|| Ok(&connection), &mut exchange, deadline);
        match result {
            Ok(reply) => {
                completed(&reply);
                match &options.pool {
                    Some(handle) => handle.put(connection, |conn| conn.abort()),
                    None => {
                        if let Err(err) =
                            connection.close(deadline.remaining().unwrap_or(Duration::ZERO))
                        {
                            debug!(error = %err, "connection close failed; aborting");
                            connection.abort();
                        }
                    }
                }
                Ok(reply)
            }
            Err(err) => {
                warn!(error = %err, "singleton request failed");
                connection.abort();
                Err(err)
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for SingletonRequestChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonRequestChannel")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn completed(reply: &Option<Bytes>) {
    debug!(
        reply_len = reply.as_ref().map_or(0, Bytes::len),
        "singleton request completed"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preamble,
    Ack,
    Request,
    Reply,
}

/// Preamble, acknowledgement, request, reply. The reply must be the last
/// thing the peer sends.
struct Exchange {
    core: SingletonCore,
    preamble: Bytes,
    request: Pooled<BytesMut>,
    stage: Stage,
}

impl Exchange {
    /// Rejects an oversized message before any I/O.
    fn new<C>(
        options: &ChannelOptions<C>,
        states: &Arc<SingletonStatePool>,
        message: &[u8],
    ) -> Result<Self> {
        let max = options.config.max_message_size;
        if message.len() > max {
            return Err(SessionError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }
        let mut request = options.buffers.take();
        write_unsized_envelope(message, options.config.chunk_size, &mut request)?;
        write_end(&mut request);

        let recv = RecvBuffer::new(options.buffers.take(), options.config.buffer_size);
        Ok(Self {
            core: SingletonCore::new(states.take(), recv),
            preamble: options.preamble.clone(),
            request,
            stage: Stage::Preamble,
        })
    }

    fn unexpected(&self) -> SessionError {
        unexpected("request", self.core.state_name())
    }
}

impl Operation for Exchange {
    type Output = Option<Bytes>;

    fn step(&mut self, done: Done) -> Result<Step<'_, Option<Bytes>>> {
        loop {
            match self.stage {
                Stage::Preamble => {
                    self.stage = Stage::Ack;
                    return Ok(Step::Io(Io::Write(&self.preamble)));
                }
                Stage::Ack => {
                    let Some(event) = self.core.poll(done)? else {
                        return Ok(Step::Io(Io::Read(self.core.recv())));
                    };
                    match event {
                        SingletonInbound::PreambleAck => self.stage = Stage::Request,
                        SingletonInbound::Fault(code) => return Err(SessionError::Fault(code)),
                        _ => return Err(self.unexpected()),
                    }
                }
                Stage::Request => {
                    self.stage = Stage::Reply;
                    return Ok(Step::Io(Io::Write(&self.request)));
                }
                Stage::Reply => {
                    let Some(event) = self.core.poll(done)? else {
                        return Ok(Step::Io(Io::Read(self.core.recv())));
                    };
                    let reply = match event {
                        SingletonInbound::Reply(body) => Some(body),
                        SingletonInbound::End => None,
                        SingletonInbound::Fault(code) => return Err(SessionError::Fault(code)),
                        _ => return Err(self.unexpected()),
                    };
                    let trailing = self.core.buffered();
                    if trailing > 0 {
                        return Err(malformed_on_close(MalformedKind::UnexpectedDataOnClose(
                            trailing,
                        )));
                    }
                    return Ok(Step::Done(reply));
                }
            }
        }
    }
}

/// Task-based counterpart of [`SingletonRequestChannel`].
///
/// Dropping the `request` future drops the connection with it.
#[cfg(feature = "async")]
pub struct AsyncSingletonRequestChannel<C: AsyncConnection> {
    connection: C,
    options: ChannelOptions<C>,
    states: Arc<SingletonStatePool>,
}

#[cfg(feature = "async")]
impl<C: AsyncConnection> AsyncSingletonRequestChannel<C> {
    pub fn new(connection: C, options: ChannelOptions<C>, states: Arc<SingletonStatePool>) -> Self {
        Self {
            connection,
            options,
            states,
        }
    }

    pub async fn request(self, message: &[u8], timeout: Duration) -> Result<Option<Bytes>> {
        let Self {
            connection,
            options,
            states,
        } = self;
        let deadline = Deadline::after(timeout);
        let mut exchange = Exchange::new(&options, &states, message)?;

        let result = async_channel::drive(|| Ok(&connection), &mut exchange, deadline).await;
        match result {
            Ok(reply) => {
                completed(&reply);
                match &options.pool {
                    Some(handle) => handle.put(connection, |conn| conn.abort()),
                    None => {
                        if let Err(err) = connection
                            .close(deadline.remaining().unwrap_or(Duration::ZERO))
                            .await
                        {
                            debug!(error = %err, "connection close failed; aborting");
                            connection.abort();
                        }
                    }
                }
                Ok(reply)
            }
            Err(err) => {
                warn!(error = %err, "singleton request failed");
                connection.abort();
                Err(err)
            }
        }
    }
}

#[cfg(feature = "async")]
impl<C: AsyncConnection> std::fmt::Debug for AsyncSingletonRequestChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSingletonRequestChannel")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use bytes::BytesMut;
    use nmfprims_frame::{
        write_fault, write_preamble_ack, ClientPreamble, FaultCode, Mode,
    };
    use nmfprims_transport::SocketConnection;

    use super::*;
    use crate::config::SessionConfig;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup() -> (
        SingletonRequestChannel<SocketConnection<UnixStream>>,
        UnixStream,
        Arc<SingletonStatePool>,
    ) {
        let (client, server) = UnixStream::pair().unwrap();
        let options = ChannelOptions::singleton(SessionConfig::default(), "net.tcp://svc/").unwrap();
        let states = singleton_state_pool(options.config.decoder_quotas(), 4);
        let channel =
            SingletonRequestChannel::new(SocketConnection::new(client), options, Arc::clone(&states));
        (channel, server, states)
    }

    fn read_exact_len(stream: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn preamble_len() -> usize {
        let mut buf = BytesMut::new();
        ClientPreamble::new(Mode::SingletonUnsized, "net.tcp://svc/", Default::default())
            .encode(&Quotas::default(), &mut buf)
            .unwrap();
        buf.len()
    }

    #[test]
    fn request_gets_reply_and_recycles_state() {
        let (channel, mut server, states) = setup();
        let peer = thread::spawn(move || {
            let preamble = read_exact_len(&mut server, preamble_len());
            assert_eq!(&preamble[3..5], &[0x01, 0x01]);
            let mut ack = BytesMut::new();
            write_preamble_ack(&mut ack);
            server.write_all(&ack).unwrap();

            let mut expected = BytesMut::new();
            write_unsized_envelope(b"ping", 0, &mut expected).unwrap();
            write_end(&mut expected);
            assert_eq!(read_exact_len(&mut server, expected.len()), &expected[..]);

            let mut reply = BytesMut::new();
            write_unsized_envelope(b"pong", 2, &mut reply).unwrap();
            write_end(&mut reply);
            server.write_all(&reply).unwrap();
        });

        let reply = channel.request(b"ping", TIMEOUT).unwrap();
        assert_eq!(reply.as_deref(), Some(&b"pong"[..]));
        peer.join().unwrap();
        assert_eq!(states.idle_count(), 1);
    }

    #[test]
    fn end_without_reply_is_none() {
        let (channel, mut server, _) = setup();
        let peer = thread::spawn(move || {
            read_exact_len(&mut server, preamble_len());
            server.write_all(&[0x0B]).unwrap();
            let mut sink = [0u8; 64];
            let _ = server.read(&mut sink).unwrap();
            server.write_all(&[0x07]).unwrap();
        });
        assert_eq!(channel.request(b"fire", TIMEOUT).unwrap(), None);
        peer.join().unwrap();
    }

    #[test]
    fn fault_in_place_of_ack() {
        let (channel, mut server, _) = setup();
        let peer = thread::spawn(move || {
            read_exact_len(&mut server, preamble_len());
            let mut fault = BytesMut::new();
            write_fault(&FaultCode::EndpointNotFound, &mut fault).unwrap();
            server.write_all(&fault).unwrap();
        });
        let err = channel.request(b"x", TIMEOUT).unwrap_err();
        assert!(matches!(err, SessionError::Fault(FaultCode::EndpointNotFound)));
        peer.join().unwrap();
    }

    #[test]
    fn eof_mid_reply_is_malformed() {
        let (channel, mut server, _) = setup();
        let peer = thread::spawn(move || {
            read_exact_len(&mut server, preamble_len());
            server.write_all(&[0x0B]).unwrap();
            let mut sink = [0u8; 64];
            let _ = server.read(&mut sink).unwrap();
            server.write_all(&[0x05, 0x04, b'p']).unwrap();
        });
        let err = channel.request(b"x", TIMEOUT).unwrap_err();
        match err {
            SessionError::Frame(frame) => assert_eq!(
                frame.malformed_kind(),
                Some(&MalformedKind::UnexpectedEof)
            ),
            other => panic!("unexpected error: {other:?}"),
        }
        peer.join().unwrap();
    }

    #[test]
    fn oversized_request_is_rejected_before_writing() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let config = SessionConfig {
            max_message_size: 4,
            ..SessionConfig::default()
        };
        let options = ChannelOptions::singleton(config, "net.tcp://svc/").unwrap();
        let states = singleton_state_pool(Quotas::default(), 1);
        let channel = SingletonRequestChannel::new(SocketConnection::new(client), options, states);

        let err = channel.request(b"too long", TIMEOUT).unwrap_err();
        assert!(matches!(err, SessionError::MessageTooLarge { size: 8, max: 4 }));

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }
}
