//! Endpoint strings (`tcp://host:port`, `unix:///path`) and a listener that
//! covers both families.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::stream::WireStream;
use crate::tcp::TcpSocket;
#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// A parsed listen/connect address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        Err(TransportError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Connect to an endpoint (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<WireStream> {
    match endpoint {
        Endpoint::Tcp(addr) => TcpSocket::connect(addr.as_str()),
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixDomainSocket::connect(path),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
    }
}

/// A bound listener of either family.
pub enum WireListener {
    Tcp(TcpSocket),
    #[cfg(unix)]
    Unix(UnixDomainSocket),
}

impl WireListener {
    /// Bind to an endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpSocket::bind(addr)?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
        }
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<WireStream> {
        match self {
            Self::Tcp(socket) => socket.accept(),
            #[cfg(unix)]
            Self::Unix(socket) => socket.accept(),
        }
    }

    /// The endpoint actually bound (resolves ephemeral TCP ports).
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            Self::Tcp(socket) => Endpoint::Tcp(socket.local_addr().to_string()),
            #[cfg(unix)]
            Self::Unix(socket) => Endpoint::Unix(socket.path().to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix() {
        assert_eq!(
            "tcp://127.0.0.1:7000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7000".to_string())
        );
        assert_eq!(
            "unix:///tmp/scene.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/scene.sock"))
        );
    }

    #[test]
    fn rejects_unknown_scheme_and_missing_port() {
        assert!(matches!(
            "udp://1.2.3.4:5".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            "tcp://localhost".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn display_roundtrips() {
        let endpoint: Endpoint = "tcp://0.0.0.0:9000".parse().unwrap();
        assert_eq!(endpoint.to_string(), "tcp://0.0.0.0:9000");
    }

    #[test]
    fn listener_reports_ephemeral_port() {
        let listener = WireListener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string())).unwrap();
        match listener.local_endpoint() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected endpoint {other}"),
        }
    }
}
