use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Limits for idle connections kept by a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections kept per key. Default: 10.
    pub max_idle_per_key: usize,
    /// Idle connections older than this are discarded on checkout. Default: 2 min.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 10,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

/// Keyed pool of idle connections shared across sessions.
///
/// A session that closes cleanly hands its connection back with
/// [`ConnectionPool::release`]; a faulted session never does. Connections
/// that do not fit, or that sat idle too long, are passed to the `discard`
/// callback supplied by the caller (normally a close or abort).
pub struct ConnectionPool<C> {
    idle: Mutex<HashMap<String, VecDeque<Idle<C>>>>,
    config: PoolConfig,
}

impl<C> ConnectionPool<C> {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the most recently released live connection for `key`.
    ///
    /// Expired entries found on the way are returned through `discard`.
    pub fn acquire(&self, key: &str, mut discard: impl FnMut(C)) -> Option<C> {
        let mut expired = Vec::new();
        let found = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = idle.get_mut(key)?;
            let mut found = None;
            while let Some(entry) = queue.pop_back() {
                if entry.since.elapsed() < self.config.idle_timeout {
                    found = Some(entry.conn);
                    break;
                }
                expired.push(entry.conn);
            }
            if queue.is_empty() {
                idle.remove(key);
            }
            found
        };

        if !expired.is_empty() {
            debug!(key, count = expired.len(), "discarding expired pooled connections");
        }
        expired.into_iter().for_each(&mut discard);
        if found.is_some() {
            debug!(key, "reusing pooled connection");
        }
        found
    }

    /// Return a connection for reuse. If the key is at capacity the
    /// connection goes to `discard` instead.
    pub fn release(&self, key: &str, conn: C, discard: impl FnOnce(C)) {
        let rejected = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = idle.entry(key.to_string()).or_default();
            if queue.len() >= self.config.max_idle_per_key {
                Some(conn)
            } else {
                queue.push_back(Idle {
                    conn,
                    since: Instant::now(),
                });
                None
            }
        };

        match rejected {
            Some(conn) => {
                debug!(key, "pool full; discarding released connection");
                discard(conn);
            }
            None => debug!(key, "connection returned to pool"),
        }
    }

    /// Number of idle connections held for `key`.
    pub fn idle_count(&self, key: &str) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, VecDeque::len)
    }

    /// Remove every idle connection, handing each to `discard`.
    pub fn drain(&self, discard: impl FnMut(C)) {
        let drained: Vec<C> = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.drain()
                .flat_map(|(_, queue)| queue.into_iter().map(|entry| entry.conn))
                .collect()
        };
        drained.into_iter().for_each(discard);
    }
}

impl<C> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .idle
            .lock()
            .map(|idle| idle.len())
            .unwrap_or_default();
        f.debug_struct("ConnectionPool")
            .field("keys", &keys)
            .field("config", &self.config)
            .finish()
    }
}
