//! Client-side message framing sessions.
//!
//! nmfprims speaks the record-oriented framing protocol used by
//! connection-oriented message services: a preamble naming the session
//! mode and endpoint, envelopes carrying whole messages, and explicit
//! `End` and `Fault` records.
//!
//! # Crate Structure
//!
//! - [`transport`]: Connection contract and socket adapters (UDS, TCP, tokio)
//! - [`frame`]: Record decoders, encoders, and buffer/state pools
//! - [`session`]: Duplex and singleton channels (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use nmfprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use nmfprims_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use nmfprims_session::*;
}
