//! Byte-stream connection contract for the framing layer.
//!
//! Provides one interface over the transports a session can run on:
//! - Unix domain sockets and TCP streams (blocking, [`SocketConnection`])
//! - tokio streams (behind the `async` feature, [`AsyncSocketConnection`])
//!
//! Every operation takes an explicit timeout and reports expiry as
//! [`TransportError::TimedOut`]. Read and write sides are tracked
//! independently, and `abort()` may be called while either side is busy.
//!
//! This is the lowest layer of nmfprims. Everything else builds on top of
//! the [`Connection`] and [`AsyncConnection`] traits provided here.

pub mod error;
pub mod pool;
pub mod socket;
pub mod traits;

#[cfg(feature = "async")]
pub mod async_socket;

pub use error::{Result, TransportError};
pub use pool::{ConnectionPool, PoolConfig};
pub use socket::{connect_tcp, SocketConnection, SocketStream};
#[cfg(unix)]
pub use socket::connect_unix;
pub use traits::{Connection, Side, SideGate, SideGuard, SideState};

#[cfg(feature = "async")]
pub use async_socket::{connect_tcp_async, AsyncSocketConnection};
#[cfg(all(feature = "async", unix))]
pub use async_socket::connect_unix_async;
#[cfg(feature = "async")]
pub use traits::AsyncConnection;
