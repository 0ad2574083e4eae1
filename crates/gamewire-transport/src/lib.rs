//! Byte-stream transports for gamewire sessions.
//!
//! Provides a unified blocking stream over the supported socket families:
//! - TCP (all platforms)
//! - Unix domain sockets (Linux/macOS)
//!
//! This is the lowest layer of gamewire. The session runtime only needs a
//! [`WireStream`] it can clone into a reader half and a writer half; frame
//! delimiting happens one layer up in `gamewire-frame`.

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use endpoint::{connect, Endpoint, WireListener};
pub use error::{Result, TransportError};
pub use stream::WireStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
