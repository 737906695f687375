//! Shared resources for creating channels.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nmfprims_frame::{BoundedCache, BufferPool, ClientPreamble, Mode};
use nmfprims_transport::{Connection, ConnectionPool, PoolConfig};
#[cfg(feature = "async")]
use nmfprims_transport::AsyncConnection;
use tracing::debug;

#[cfg(feature = "async")]
use crate::async_channel::AsyncDuplexSessionChannel;
use crate::channel::{ChannelOptions, DuplexSessionChannel};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::lifecycle::PoolHandle;
#[cfg(feature = "async")]
use crate::singleton::AsyncSingletonRequestChannel;
use crate::singleton::{singleton_state_pool, SingletonRequestChannel, SingletonStatePool};

/// Creates channels that share one configuration, one buffer pool, one
/// recycled decoder-state pool and one preamble cache.
///
/// With a connection pool attached, cleanly closed channels hand their
/// connection back keyed by `via`, and the `connect_*` helpers check one
/// out before dialing.
pub struct ChannelFactory<C> {
    config: Arc<SessionConfig>,
    buffers: Arc<BufferPool>,
    states: Arc<SingletonStatePool>,
    preambles: BoundedCache<ClientPreamble, Bytes>,
    pool: Option<Arc<ConnectionPool<C>>>,
}

impl<C> ChannelFactory<C> {
    pub fn new(config: SessionConfig) -> Self {
        let buffers = Arc::new(BufferPool::with_buffer_size(
            config.buffer_size,
            config.max_idle_buffers,
        ));
        let states = singleton_state_pool(config.decoder_quotas(), config.max_idle_buffers);
        Self {
            preambles: BoundedCache::new(config.preamble_cache_capacity),
            config: Arc::new(config),
            buffers,
            states,
            pool: None,
        }
    }

    /// Keep idle connections for reuse.
    pub fn with_connection_pool(mut self, config: PoolConfig) -> Self {
        self.pool = Some(Arc::new(ConnectionPool::with_config(config)));
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn singleton_states(&self) -> &Arc<SingletonStatePool> {
        &self.states
    }

    pub fn connection_pool(&self) -> Option<&Arc<ConnectionPool<C>>> {
        self.pool.as_ref()
    }

    /// Encoded preamble for `mode` and `via`, cached after first use.
    pub fn preamble(&self, mode: Mode, via: &str) -> Result<Bytes> {
        let key = ClientPreamble::new(mode, via, self.config.encoding.clone());
        self.preambles.get_or_try_insert_with(key, |preamble| {
            let mut buf = BytesMut::new();
            preamble.encode(&self.config.quotas, &mut buf)?;
            debug!(via, ?mode, len = buf.len(), "encoded client preamble");
            Ok::<_, SessionError>(buf.freeze())
        })
    }

    /// Options for a channel in `mode` to `via`, wired to this factory's
    /// pools.
    pub fn options(&self, mode: Mode, via: &str) -> Result<ChannelOptions<C>> {
        Ok(ChannelOptions {
            config: Arc::clone(&self.config),
            buffers: Arc::clone(&self.buffers),
            preamble: self.preamble(mode, via)?,
            pool: self
                .pool
                .as_ref()
                .map(|pool| PoolHandle::new(Arc::clone(pool), via)),
        })
    }
}

impl<C: Connection> ChannelFactory<C> {
    /// An idle pooled connection for `via`, if any. Expired entries are
    /// aborted.
    pub fn checkout(&self, via: &str) -> Option<C> {
        self.pool.as_ref()?.acquire(via, |conn| conn.abort())
    }

    pub fn open_duplex(
        &self,
        connection: C,
        via: &str,
        timeout: Duration,
    ) -> Result<DuplexSessionChannel<C>> {
        let options = self.options(Mode::Duplex, via)?;
        DuplexSessionChannel::open(connection, options, timeout)
    }

    pub fn singleton(&self, connection: C, via: &str) -> Result<SingletonRequestChannel<C>> {
        let options = self.options(Mode::SingletonUnsized, via)?;
        Ok(SingletonRequestChannel::new(
            connection,
            options,
            Arc::clone(&self.states),
        ))
    }
}

#[cfg(feature = "async")]
impl<C: AsyncConnection> ChannelFactory<C> {
    pub fn checkout_async(&self, via: &str) -> Option<C> {
        self.pool.as_ref()?.acquire(via, |conn| conn.abort())
    }

    pub async fn open_duplex_async(
        &self,
        connection: C,
        via: &str,
        timeout: Duration,
    ) -> Result<AsyncDuplexSessionChannel<C>> {
        let options = self.options(Mode::Duplex, via)?;
        AsyncDuplexSessionChannel::open(connection, options, timeout).await
    }

    pub fn singleton_async(
        &self,
        connection: C,
        via: &str,
    ) -> Result<AsyncSingletonRequestChannel<C>> {
        let options = self.options(Mode::SingletonUnsized, via)?;
        Ok(AsyncSingletonRequestChannel::new(
            connection,
            options,
            Arc::clone(&self.states),
        ))
    }
}

#[cfg(unix)]
impl ChannelFactory<nmfprims_transport::SocketConnection<std::os::unix::net::UnixStream>> {
    /// Open a duplex session to `via` over the Unix socket at `path`,
    /// reusing a pooled connection when one is idle.
    pub fn connect_unix(
        &self,
        path: impl AsRef<std::path::Path>,
        via: &str,
    ) -> Result<DuplexSessionChannel<nmfprims_transport::SocketConnection<std::os::unix::net::UnixStream>>>
    {
        let connection = match self.checkout(via) {
            Some(conn) => conn,
            None => nmfprims_transport::connect_unix(path)?,
        };
        self.open_duplex(connection, via, self.config.open_timeout)
    }
}

impl ChannelFactory<nmfprims_transport::SocketConnection<std::net::TcpStream>> {
    /// Open a duplex session to `via` over TCP. Connecting and the preamble
    /// exchange share `open_timeout`.
    pub fn connect_tcp(
        &self,
        addr: impl std::net::ToSocketAddrs,
        via: &str,
    ) -> Result<DuplexSessionChannel<nmfprims_transport::SocketConnection<std::net::TcpStream>>> {
        let started = std::time::Instant::now();
        let connection = match self.checkout(via) {
            Some(conn) => conn,
            None => nmfprims_transport::connect_tcp(addr, self.config.open_timeout)?,
        };
        let left = self.config.open_timeout.saturating_sub(started.elapsed());
        self.open_duplex(connection, via, left)
    }
}

#[cfg(all(feature = "async", unix))]
impl ChannelFactory<nmfprims_transport::AsyncSocketConnection<tokio::net::UnixStream>> {
    pub async fn connect_unix_async(
        &self,
        path: impl AsRef<std::path::Path>,
        via: &str,
    ) -> Result<
        AsyncDuplexSessionChannel<nmfprims_transport::AsyncSocketConnection<tokio::net::UnixStream>>,
    > {
        let started = std::time::Instant::now();
        let connection = match self.checkout_async(via) {
            Some(conn) => conn,
            None => nmfprims_transport::connect_unix_async(path, self.config.open_timeout).await?,
        };
        let left = self.config.open_timeout.saturating_sub(started.elapsed());
        self.open_duplex_async(connection, via, left).await
    }
}

#[cfg(feature = "async")]
impl ChannelFactory<nmfprims_transport::AsyncSocketConnection<tokio::net::TcpStream>> {
    pub async fn connect_tcp_async(
        &self,
        addr: impl tokio::net::ToSocketAddrs + std::fmt::Debug,
        via: &str,
    ) -> Result<
        AsyncDuplexSessionChannel<nmfprims_transport::AsyncSocketConnection<tokio::net::TcpStream>>,
    > {
        let started = std::time::Instant::now();
        let connection = match self.checkout_async(via) {
            Some(conn) => conn,
            None => nmfprims_transport::connect_tcp_async(addr, self.config.open_timeout).await?,
        };
        let left = self.config.open_timeout.saturating_sub(started.elapsed());
        self.open_duplex_async(connection, via, left).await
    }
}

impl<C> std::fmt::Debug for ChannelFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("config", &self.config)
            .field("cached_preambles", &self.preambles.len())
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}
