//! Session-based RPC runtime for game-server clusters.
//!
//! gamewire carries request/response and one-way traffic between cluster
//! nodes over checksummed frames, with every session pinned to a
//! single-consumer event loop.
//!
//! # Crate Structure
//!
//! - [`transport`]: blocking TCP and Unix domain socket streams
//! - [`frame`]: frame layout, checksum and message catalog
//! - [`event_loop`]: ring-buffer event loops, timers and completions
//! - [`session`]: handshake, pipeline, ordered delivery and RPC (behind the
//!   `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use gamewire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use gamewire_frame::*;
}

/// Re-export event loop types.
pub mod event_loop {
    pub use gamewire_loop::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use gamewire_session::*;
}
