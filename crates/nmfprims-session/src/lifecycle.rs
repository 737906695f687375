//! State and connection ownership shared by the blocking and async channels.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nmfprims_transport::ConnectionPool;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::state::{SessionEvent, SessionState};

/// Where a channel returns its connection after a clean close.
pub struct PoolHandle<C> {
    pool: Arc<ConnectionPool<C>>,
    key: String,
}

impl<C> PoolHandle<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn put(&self, conn: C, discard: impl FnOnce(C)) {
        debug!(key = %self.key, "returning connection to pool");
        self.pool.release(&self.key, conn, discard);
    }
}

impl<C> Clone for PoolHandle<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            key: self.key.clone(),
        }
    }
}

impl<C> std::fmt::Debug for PoolHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").field("key", &self.key).finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session state plus the connection it governs.
///
/// Operations clone the connection handle under a short lock and drive I/O
/// without holding it, so a fault on one side can take the connection away
/// and abort it while the other side is blocked.
pub(crate) struct Lifecycle<C> {
    state: Mutex<SessionState>,
    connection: Mutex<Option<Arc<C>>>,
    pool: Option<PoolHandle<C>>,
}

impl<C> Lifecycle<C> {
    pub(crate) fn new(connection: C, pool: Option<PoolHandle<C>>) -> Self {
        Self {
            state: Mutex::new(SessionState::Open),
            connection: Mutex::new(Some(Arc::new(connection))),
            pool,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Current state if `allowed` accepts it. Faulted channels fail with
    /// [`SessionError::ChannelFaulted`] whatever the operation.
    pub(crate) fn ensure(
        &self,
        op: &'static str,
        allowed: impl FnOnce(SessionState) -> bool,
    ) -> Result<SessionState> {
        let state = self.state();
        if state == SessionState::Faulted {
            return Err(SessionError::ChannelFaulted);
        }
        if allowed(state) {
            Ok(state)
        } else {
            Err(SessionError::InvalidState {
                op,
                state: state.name(),
            })
        }
    }

    /// Whether the peer may still send records. Fails once the channel is
    /// faulted or closed.
    pub(crate) fn input_open(&self, op: &'static str) -> Result<bool> {
        Ok(self.ensure(op, |s| !s.is_terminal())?.input_open())
    }

    /// Apply `event`. An illegal transition leaves the state unchanged.
    pub(crate) fn apply(&self, op: &'static str, event: SessionEvent) -> Result<SessionState> {
        let mut state = lock(&self.state);
        match state.on(event) {
            Some(next) => {
                debug!(from = %*state, to = %next, ?event, "session state change");
                *state = next;
                Ok(next)
            }
            None if *state == SessionState::Faulted => Err(SessionError::ChannelFaulted),
            None => Err(SessionError::InvalidState {
                op,
                state: state.name(),
            }),
        }
    }

    pub(crate) fn connection(&self) -> Result<Arc<C>> {
        if let Some(conn) = lock(&self.connection).as_ref() {
            return Ok(Arc::clone(conn));
        }
        match self.state() {
            SessionState::Faulted => Err(SessionError::ChannelFaulted),
            state => Err(SessionError::InvalidState {
                op: "use connection",
                state: state.name(),
            }),
        }
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<C>> {
        lock(&self.connection).take()
    }

    /// Move to `Faulted`. Returns the connection to abort if this call made
    /// the transition; later faults return `None` so the connection is
    /// aborted exactly once.
    pub(crate) fn fault(&self, err: &SessionError) -> Option<Arc<C>> {
        {
            let mut state = lock(&self.state);
            let next = state.on(SessionEvent::Fault)?;
            warn!(from = %*state, error = %err, "session faulted");
            *state = next;
        }
        self.take_connection()
    }

    /// Move to `Closed` from any live state. Returns the connection to
    /// abort, if one is still held.
    pub(crate) fn abort(&self) -> Option<Arc<C>> {
        {
            let mut state = lock(&self.state);
            if let Some(next) = state.on(SessionEvent::Abort) {
                debug!(from = %*state, "session aborted");
                *state = next;
            }
        }
        self.take_connection()
    }

    /// Hand the connection back to its pool. Returns it instead when it must
    /// be closed: there is no pool, or an operation still holds a handle.
    pub(crate) fn release(&self, discard: impl FnOnce(C)) -> Option<Arc<C>> {
        let conn = self.take_connection()?;
        let Some(handle) = &self.pool else {
            return Some(conn);
        };
        match Arc::try_unwrap(conn) {
            Ok(conn) => {
                handle.put(conn, discard);
                None
            }
            Err(shared) => Some(shared),
        }
    }
}
