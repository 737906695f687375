use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// One direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Read => f.write_str("read"),
            Side::Write => f.write_str("write"),
        }
    }
}

/// Observable state of one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideState {
    Idle,
    Pending,
    Closed,
}

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const CLOSED: u8 = 2;

/// Tracks one side of a connection and enforces "at most one outstanding
/// operation".
///
/// Adapters hold one gate per side so that a blocked read never holds up a
/// write and vice versa.
#[derive(Debug)]
pub struct SideGate {
    side: Side,
    state: AtomicU8,
}

impl SideGate {
    pub const fn new(side: Side) -> Self {
        Self {
            side,
            state: AtomicU8::new(IDLE),
        }
    }

    /// Mark the side pending for the lifetime of the returned guard.
    ///
    /// Fails with [`TransportError::Pending`] if an operation is already in
    /// flight, or [`TransportError::Closed`] once the side has been closed.
    pub fn begin(&self) -> Result<SideGuard<'_>> {
        match self
            .state
            .compare_exchange(IDLE, PENDING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(SideGuard { gate: self }),
            Err(PENDING) => Err(TransportError::Pending(self.side)),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Permanently close this side. A pending guard stays valid until dropped.
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn state(&self) -> SideState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SideState::Idle,
            PENDING => SideState::Pending,
            _ => SideState::Closed,
        }
    }
}

/// Returns its side to `Idle` on drop unless the side was closed meanwhile.
#[derive(Debug)]
pub struct SideGuard<'a> {
    gate: &'a SideGate,
}

impl Drop for SideGuard<'_> {
    fn drop(&mut self) {
        let _ = self.gate.state.compare_exchange(
            PENDING,
            IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// A transport connection as consumed by a session channel (blocking).
///
/// All methods take `&self`: the read side, the write side and `abort()` may
/// be driven from different threads at the same time. Issuing a second read
/// (or write) while one is still pending is a contract violation and fails
/// with [`TransportError::Pending`].
pub trait Connection: Send + Sync {
    /// Read available bytes into `buf`. Returns `Ok(0)` at end of stream.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `buf`. When `immediate` is set the stream is flushed too.
    fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()>;

    /// Half-close: signal end of output while keeping the read side open.
    fn shutdown(&self, timeout: Duration) -> Result<()>;

    /// Gracefully close both sides.
    fn close(&self, timeout: Duration) -> Result<()>;

    /// Tear the connection down immediately. Never fails; in-flight reads and
    /// writes fail promptly with [`TransportError::Aborted`].
    fn abort(&self);

    /// Transport name for diagnostics.
    fn transport_name(&self) -> &'static str {
        "connection"
    }
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()> {
        (**self).write(buf, immediate, timeout)
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        (**self).shutdown(timeout)
    }

    fn close(&self, timeout: Duration) -> Result<()> {
        (**self).close(timeout)
    }

    fn abort(&self) {
        (**self).abort()
    }

    fn transport_name(&self) -> &'static str {
        (**self).transport_name()
    }
}

/// Task-based counterpart of [`Connection`].
///
/// Same contract; the futures are `Send` so channels built on top can be
/// driven from spawned tasks.
#[cfg(feature = "async")]
pub trait AsyncConnection: Send + Sync {
    fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<usize>> + Send;

    fn write(
        &self,
        buf: &[u8],
        immediate: bool,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn shutdown(&self, timeout: Duration) -> impl std::future::Future<Output = Result<()>> + Send;

    fn close(&self, timeout: Duration) -> impl std::future::Future<Output = Result<()>> + Send;

    fn abort(&self);

    fn transport_name(&self) -> &'static str {
        "connection"
    }
}

#[cfg(feature = "async")]
impl<C: AsyncConnection + ?Sized> AsyncConnection for Arc<C> {
    fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<usize>> + Send {
        (**self).read(buf, timeout)
    }

    fn write(
        &self,
        buf: &[u8],
        immediate: bool,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).write(buf, immediate, timeout)
    }

    fn shutdown(&self, timeout: Duration) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).shutdown(timeout)
    }

    fn close(&self, timeout: Duration) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).close(timeout)
    }

    fn abort(&self) {
        (**self).abort()
    }

    fn transport_name(&self) -> &'static str {
        (**self).transport_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejects_second_pending_operation() {
        let gate = SideGate::new(Side::Read);
        let guard = gate.begin().unwrap();
        assert_eq!(gate.state(), SideState::Pending);

        let err = gate.begin().unwrap_err();
        assert!(matches!(err, TransportError::Pending(Side::Read)));

        drop(guard);
        assert_eq!(gate.state(), SideState::Idle);
        assert!(gate.begin().is_ok());
    }

    #[test]
    fn closed_gate_stays_closed_after_guard_drop() {
        let gate = SideGate::new(Side::Write);
        let guard = gate.begin().unwrap();
        gate.close();
        drop(guard);

        assert_eq!(gate.state(), SideState::Closed);
        assert!(matches!(gate.begin(), Err(TransportError::Closed)));
    }

    #[test]
    fn side_display() {
        assert_eq!(Side::Read.to_string(), "read");
        assert_eq!(
            TransportError::Pending(Side::Write).to_string(),
            "a write is already pending on this connection"
        );
    }
}
