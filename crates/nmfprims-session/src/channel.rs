use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nmfprims_frame::{BufferPool, ClientPreamble, Mode};
use nmfprims_transport::Connection;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::deadline::Deadline;
use crate::error::{Result, SessionError};
use crate::inbound::{InboundCore, RecvBuffer};
use crate::lifecycle::{lock, Lifecycle, PoolHandle};
use crate::ops::{
    check_send, CloseInput, CloseOutput, Done, Handshake, Io, Operation, Receive, SendMessage,
    Step,
};
use crate::state::SessionState;

/// Everything a channel needs besides its connection.
///
/// Built by [`ChannelFactory`](crate::ChannelFactory); construct directly
/// when channels are created without a factory.
pub struct ChannelOptions<C> {
    pub config: Arc<SessionConfig>,
    pub buffers: Arc<BufferPool>,
    /// Encoded client preamble.
    pub preamble: Bytes,
    pub pool: Option<PoolHandle<C>>,
}

impl<C> ChannelOptions<C> {
    /// Options for a duplex session to `via` with a private buffer pool and
    /// no connection pooling.
    pub fn duplex(config: SessionConfig, via: &str) -> Result<Self> {
        Self::for_mode(config, Mode::Duplex, via)
    }

    /// Options for singleton request/reply exchanges with `via`.
    pub fn singleton(config: SessionConfig, via: &str) -> Result<Self> {
        Self::for_mode(config, Mode::SingletonUnsized, via)
    }

    pub(crate) fn for_mode(config: SessionConfig, mode: Mode, via: &str) -> Result<Self> {
        let preamble = ClientPreamble::new(mode, via, config.encoding.clone());
        let mut buf = BytesMut::new();
        preamble.encode(&config.quotas, &mut buf)?;
        Ok(Self {
            buffers: Arc::new(BufferPool::with_buffer_size(
                config.buffer_size,
                config.max_idle_buffers,
            )),
            config: Arc::new(config),
            preamble: buf.freeze(),
            pool: None,
        })
    }
}

impl<C> Clone for ChannelOptions<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            buffers: Arc::clone(&self.buffers),
            preamble: self.preamble.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<C> std::fmt::Debug for ChannelOptions<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("config", &self.config)
            .field("preamble_len", &self.preamble.len())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Blocking duplex session over a [`Connection`].
///
/// Sends are serialized by a single-writer gate; receives decode inbound
/// records through one shared cursor, so at most one receive runs at a
/// time. Any error from `send` or `receive` faults the channel and aborts
/// the connection; every later `send` or `receive` fails with
/// [`SessionError::ChannelFaulted`] without touching the connection.
pub struct DuplexSessionChannel<C: Connection> {
    lifecycle: Lifecycle<C>,
    send_gate: Mutex<()>,
    inbound: Mutex<InboundCore>,
    config: Arc<SessionConfig>,
    buffers: Arc<BufferPool>,
}

impl<C: Connection> DuplexSessionChannel<C> {
    /// Send the preamble and wait for the peer's acknowledgement.
    ///
    /// On failure the connection is aborted. A `Fault` in place of the
    /// acknowledgement is reported as [`SessionError::Fault`].
    pub fn open(connection: C, options: ChannelOptions<C>, timeout: Duration) -> Result<Self> {
        let deadline = Deadline::after(timeout);
        let transport = connection.transport_name();
        let recv = RecvBuffer::new(options.buffers.take(), options.config.buffer_size);
        let channel = Self {
            lifecycle: Lifecycle::new(connection, options.pool),
            send_gate: Mutex::new(()),
            inbound: Mutex::new(InboundCore::new(&options.config.decoder_quotas(), recv)),
            config: options.config,
            buffers: options.buffers,
        };

        {
            let mut inbound = lock(&channel.inbound);
            channel.run(&mut Handshake::new(&options.preamble, &mut inbound), deadline)?;
        }
        info!(transport, "duplex session opened");
        Ok(channel)
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Frame `message` as one envelope and write it.
    ///
    /// Messages over `max_message_size` are rejected before anything is
    /// written, without faulting the channel.
    pub fn send(&self, message: &[u8], timeout: Duration) -> Result<()> {
        check_send(&self.lifecycle, &self.config, message)?;
        let deadline = Deadline::after(timeout);
        let mut op = SendMessage::new(&self.buffers, message)?;

        let _gate = lock(&self.send_gate);
        // Output may have closed while we queued for the gate.
        self.lifecycle.ensure("send", SessionState::can_send)?;
        self.run(&mut op, deadline)
    }

    /// Wait for the next message. `Ok(None)` means the peer ended its
    /// output; every later call returns `Ok(None)` too.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Bytes>> {
        if !self.lifecycle.input_open("receive")? {
            return Ok(None);
        }
        let deadline = Deadline::after(timeout);

        let mut inbound = lock(&self.inbound);
        // Another receiver may have seen `End` while we waited.
        if !self.lifecycle.input_open("receive")? {
            return Ok(None);
        }
        self.run(&mut Receive::new(&self.lifecycle, &mut inbound), deadline)
    }

    /// Close our output: write `End`, then half-close the transport.
    ///
    /// Idempotent: once output is closing or closed, later calls return
    /// `Ok(())` without touching the connection. When the peer has already
    /// ended its output this completes the close and releases the connection.
    pub fn close_output_session(&self, timeout: Duration) -> Result<()> {
        self.close_output(Deadline::after(timeout))
    }

    /// Close both directions and release the connection.
    ///
    /// Closes output, waits for the peer's `End` (a message arriving instead
    /// is a protocol violation), checks that nothing follows it, then
    /// returns the connection to its pool or closes it. Closing a closed or
    /// faulted channel is a no-op.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        if self.lifecycle.state().is_terminal() {
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        self.close_output(deadline)?;
        self.close_input(deadline)
    }

    /// Tear the channel down without a handshake. Never fails.
    pub fn abort(&self) {
        if let Some(conn) = self.lifecycle.abort() {
            conn.abort();
        }
    }

    fn close_output(&self, deadline: Deadline) -> Result<()> {
        let input_ended = {
            let _gate = lock(&self.send_gate);
            self.run(&mut CloseOutput::new(&self.lifecycle, &self.buffers), deadline)?
        };
        if input_ended {
            self.close_input(deadline)?;
        }
        Ok(())
    }

    fn close_input(&self, deadline: Deadline) -> Result<()> {
        let released = {
            let mut inbound = lock(&self.inbound);
            self.run(&mut CloseInput::new(&self.lifecycle, &mut inbound), deadline)?
        };
        if !released {
            return Ok(());
        }
        if let Some(conn) = self.lifecycle.release(|conn| conn.abort()) {
            if let Err(err) = conn.close(deadline.remaining().unwrap_or(Duration::ZERO)) {
                debug!(error = %err, "connection close failed; aborting");
                conn.abort();
            }
        }
        info!("duplex session closed");
        Ok(())
    }

    /// Drive `op` against the connection. Any failure faults the channel.
    fn run<O: Operation>(&self, op: &mut O, deadline: Deadline) -> Result<O::Output> {
        drive(|| self.lifecycle.connection(), op, deadline).map_err(|err| self.fail(err))
    }

    fn fail(&self, err: SessionError) -> SessionError {
        if let Some(conn) = self.lifecycle.fault(&err) {
            conn.abort();
        }
        err
    }
}

impl<C: Connection> Drop for DuplexSessionChannel<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.lifecycle.take_connection() {
            debug!("channel dropped while open; aborting connection");
            conn.abort();
        }
    }
}

impl<C: Connection> std::fmt::Debug for DuplexSessionChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSessionChannel")
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

/// Perform the connection calls `op` asks for until it finishes.
///
/// The connection is fetched on the first call that needs it, so an
/// operation that completes without I/O never touches it.
pub(crate) fn drive<C, R, O>(
    mut connection: impl FnMut() -> Result<R>,
    op: &mut O,
    deadline: Deadline,
) -> Result<O::Output>
where
    C: Connection + ?Sized,
    R: Deref<Target = C>,
    O: Operation,
{
    let mut held = None;
    let mut done = Done::Start;
    loop {
        let io = match op.step(done)? {
            Step::Done(output) => return Ok(output),
            Step::Io(io) => io,
        };
        let conn = match held.take() {
            Some(conn) => conn,
            None => connection()?,
        };
        let result = perform(&*conn, io, deadline);
        held = Some(conn);
        done = result?;
    }
}

fn perform<C: Connection + ?Sized>(conn: &C, io: Io<'_>, deadline: Deadline) -> Result<Done> {
    Ok(match io {
        Io::Write(buf) => {
            conn.write(buf, true, deadline.remaining()?)?;
            Done::Wrote
        }
        Io::Shutdown => {
            conn.shutdown(deadline.remaining()?)?;
            Done::ShutDown
        }
        Io::Read(recv) => {
            let timeout = deadline.remaining()?;
            let mut window = recv.read_window();
            let n = conn.read(&mut window, timeout)?;
            window.commit(n);
            Done::Read(n)
        }
    })
}
