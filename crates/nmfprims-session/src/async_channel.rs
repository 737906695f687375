use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nmfprims_frame::BufferPool;
use nmfprims_transport::AsyncConnection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::channel::ChannelOptions;
use crate::config::SessionConfig;
use crate::deadline::Deadline;
use crate::error::{Result, SessionError};
use crate::inbound::{InboundCore, RecvBuffer};
use crate::lifecycle::Lifecycle;
use crate::ops::{
    check_send, CloseInput, CloseOutput, Done, Handshake, Io, Operation, Receive, SendMessage,
    Step,
};
use crate::state::SessionState;

/// Task-based duplex session over an [`AsyncConnection`].
///
/// Same protocol, state table and fault rules as
/// [`DuplexSessionChannel`](crate::DuplexSessionChannel); only the waiting
/// differs. Waiting for the send gate counts against the operation's
/// timeout.
///
/// Dropping a `receive` future keeps every byte already read for the next
/// call. Dropping a `send` or `close_output_session` future after its write
/// started faults the channel, since the peer may hold a partial record.
pub struct AsyncDuplexSessionChannel<C: AsyncConnection> {
    lifecycle: Lifecycle<C>,
    send_gate: Mutex<()>,
    inbound: Mutex<InboundCore>,
    config: Arc<SessionConfig>,
    buffers: Arc<BufferPool>,
}

async fn lock_by<'a, T>(mutex: &'a Mutex<T>, deadline: Deadline) -> Result<MutexGuard<'a, T>> {
    tokio::time::timeout(deadline.remaining()?, mutex.lock())
        .await
        .map_err(|_| SessionError::TimedOut(deadline.timeout()))
}

/// Faults the channel if dropped before [`disarm`](Self::disarm).
struct FaultOnCancel<'a, C: AsyncConnection> {
    lifecycle: &'a Lifecycle<C>,
    armed: bool,
}

impl<'a, C: AsyncConnection> FaultOnCancel<'a, C> {
    fn arm(lifecycle: &'a Lifecycle<C>) -> Self {
        Self {
            lifecycle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: AsyncConnection> Drop for FaultOnCancel<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(conn) = self.lifecycle.fault(&SessionError::Cancelled) {
            conn.abort();
        }
    }
}

impl<C: AsyncConnection> AsyncDuplexSessionChannel<C> {
    pub async fn open(
        connection: C,
        options: ChannelOptions<C>,
        timeout: Duration,
    ) -> Result<Self> {
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
            let mut inbound = channel.inbound.lock().await;
            channel
                .run(&mut Handshake::new(&options.preamble, &mut inbound), deadline)
                .await?;
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

    pub async fn send(&self, message: &[u8], timeout: Duration) -> Result<()> {
        check_send(&self.lifecycle, &self.config, message)?;
        let deadline = Deadline::after(timeout);
        let mut op = SendMessage::new(&self.buffers, message)?;

        let _gate = lock_by(&self.send_gate, deadline).await?;
        self.lifecycle.ensure("send", SessionState::can_send)?;
        let cancel = FaultOnCancel::arm(&self.lifecycle);
        let result = self.run(&mut op, deadline).await;
        cancel.disarm();
        result
    }

    pub async fn receive(&self, timeout: Duration) -> Result<Option<Bytes>> {
        if !self.lifecycle.input_open("receive")? {
            return Ok(None);
        }
        let deadline = Deadline::after(timeout);

        let mut inbound = lock_by(&self.inbound, deadline).await?;
        if !self.lifecycle.input_open("receive")? {
            return Ok(None);
        }
        self.run(&mut Receive::new(&self.lifecycle, &mut inbound), deadline)
            .await
    }

    pub async fn close_output_session(&self, timeout: Duration) -> Result<()> {
        self.close_output(Deadline::after(timeout)).await
    }

    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.lifecycle.state().is_terminal() {
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        self.close_output(deadline).await?;
        self.close_input(deadline).await
    }

    pub fn abort(&self) {
        if let Some(conn) = self.lifecycle.abort() {
            conn.abort();
        }
    }

    async fn close_output(&self, deadline: Deadline) -> Result<()> {
        let input_ended = {
            let _gate = lock_by(&self.send_gate, deadline).await?;
            let cancel = FaultOnCancel::arm(&self.lifecycle);
            let result = self
                .run(&mut CloseOutput::new(&self.lifecycle, &self.buffers), deadline)
                .await;
            cancel.disarm();
            result?
        };
        if input_ended {
            self.close_input(deadline).await?;
        }
        Ok(())
    }

    async fn close_input(&self, deadline: Deadline) -> Result<()> {
        let released = {
            let mut inbound = lock_by(&self.inbound, deadline).await?;
            self.run(&mut CloseInput::new(&self.lifecycle, &mut inbound), deadline)
                .await?
        };
        if !released {
            return Ok(());
        }
        if let Some(conn) = self.lifecycle.release(|conn| conn.abort()) {
            if let Err(err) = conn
                .close(deadline.remaining().unwrap_or(Duration::ZERO))
                .await
            {
                debug!(error = %err, "connection close failed; aborting");
                conn.abort();
            }
        }
        info!("duplex session closed");
        Ok(())
    }

    async fn run<O: Operation>(&self, op: &mut O, deadline: Deadline) -> Result<O::Output> {
        drive(|| self.lifecycle.connection(), op, deadline)
            .await
            .map_err(|err| self.fail(err))
    }

    fn fail(&self, err: SessionError) -> SessionError {
        if let Some(conn) = self.lifecycle.fault(&err) {
            conn.abort();
        }
        err
    }
}

/// Task-based counterpart of [`drive`](crate::channel::drive).
pub(crate) async fn drive<C, R, O>(
    mut connection: impl FnMut() -> Result<R>,
    op: &mut O,
    deadline: Deadline,
) -> Result<O::Output>
where
    C: AsyncConnection + ?Sized,
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
        let result = perform(&*conn, io, deadline).await;
        held = Some(conn);
        done = result?;
    }
}

async fn perform<C: AsyncConnection + ?Sized>(
    conn: &C,
    io: Io<'_>,
    deadline: Deadline,
) -> Result<Done> {
    Ok(match io {
        Io::Write(buf) => {
            conn.write(buf, true, deadline.remaining()?).await?;
            Done::Wrote
        }
        Io::Shutdown => {
            conn.shutdown(deadline.remaining()?).await?;
            Done::ShutDown
        }
        Io::Read(recv) => {
            let timeout = deadline.remaining()?;
            let mut window = recv.read_window();
            let n = conn.read(&mut window, timeout).await?;
            window.commit(n);
            Done::Read(n)
        }
    })
}

impl<C: AsyncConnection> Drop for AsyncDuplexSessionChannel<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.lifecycle.take_connection() {
            debug!("channel dropped while open; aborting connection");
            conn.abort();
        }
    }
}

impl<C: AsyncConnection> std::fmt::Debug for AsyncDuplexSessionChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDuplexSessionChannel")
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}
