//! Client session channels for the message framing protocol.
//!
//! This is the layer applications talk to. A [`DuplexSessionChannel`] sends
//! and receives whole messages over one connection until either side ends
//! its output; a [`SingletonRequestChannel`] performs one request/reply
//! exchange. A [`ChannelFactory`] shares buffers, decoder state and encoded
//! preambles across the channels it creates, and can pool connections.
//!
//! With the `async` feature the same channels are available over tokio
//! through [`AsyncDuplexSessionChannel`] and
//! [`AsyncSingletonRequestChannel`].

#[cfg(feature = "async")]
pub mod async_channel;
pub mod channel;
pub mod config;
mod deadline;
pub mod error;
pub mod factory;
mod inbound;
pub mod lifecycle;
mod ops;
pub mod singleton;
pub mod state;

#[cfg(feature = "async")]
pub use async_channel::AsyncDuplexSessionChannel;
pub use channel::{ChannelOptions, DuplexSessionChannel};
pub use config::{SessionConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{Result, SessionError};
pub use factory::ChannelFactory;
pub use lifecycle::PoolHandle;
#[cfg(feature = "async")]
pub use singleton::AsyncSingletonRequestChannel;
pub use singleton::{
    singleton_state_pool, SingletonDecoders, SingletonRequestChannel, SingletonStatePool,
};
pub use state::{SessionEvent, SessionState};
