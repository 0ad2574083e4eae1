use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// TCP listener used between cluster nodes on different hosts.
pub struct TcpSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocket {
    /// Bind and listen on a TCP address. Port 0 picks an ephemeral port.
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    ///
    /// Nagle is disabled on accepted streams; frames are small and latency-bound.
    pub fn accept(&self) -> Result<WireStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(stream.into())
    }

    /// Connect to a listening TCP address (blocking).
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<WireStream> {
        let label = addr.to_string();
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: label.clone(),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        debug!(addr = %label, "connected over tcp");
        Ok(stream.into())
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn bind_ephemeral_accept_connect() {
        let listener = TcpSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let client = std::thread::spawn(move || {
            let mut stream = TcpSocket::connect(addr).unwrap();
            stream.write_all(b"gate").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"gate");
        assert_eq!(server.transport_name(), "tcp");
        client.join().unwrap();
    }

    #[test]
    fn connect_refused_reports_address() {
        let listener = TcpSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        drop(listener);

        let err = TcpSocket::connect(addr).unwrap_err();
        match err {
            TransportError::Connect { addr: label, .. } => assert_eq!(label, addr.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
