//! Message type codes.

use std::fmt;

/// The type byte carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// initiator → responder: identity, attempt counter, initial sequence, ack.
    ConnectRequest = 1,
    /// responder → initiator: success flag, mirrored attempt counter, sequence, ack.
    ConnectResponse = 2,
    RpcRequest = 3,
    RpcResponse = 4,
    OneWay = 5,
    Ping = 6,
    Pong = 7,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::ConnectRequest,
        MessageKind::ConnectResponse,
        MessageKind::RpcRequest,
        MessageKind::RpcResponse,
        MessageKind::OneWay,
        MessageKind::Ping,
        MessageKind::Pong,
    ];

    /// Look up a kind by its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectRequest => "CONNECT_REQUEST",
            Self::ConnectResponse => "CONNECT_RESPONSE",
            Self::RpcRequest => "RPC_REQUEST",
            Self::RpcResponse => "RPC_RESPONSE",
            Self::OneWay => "ONE_WAY",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Handshake messages: a body failure on these closes the connection.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::ConnectRequest | Self::ConnectResponse)
    }

    /// Kinds stamped with sequence/ack by the ordered-delivery overlay.
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::RpcRequest | Self::RpcResponse | Self::OneWay)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageKind::from_code(0), None);
        assert_eq!(MessageKind::from_code(8), None);
    }

    #[test]
    fn classification() {
        assert!(MessageKind::ConnectRequest.is_handshake());
        assert!(!MessageKind::Ping.is_handshake());
        assert!(MessageKind::OneWay.is_sequenced());
        assert!(!MessageKind::Pong.is_sequenced());
        assert_eq!(MessageKind::RpcResponse.to_string(), "RPC_RESPONSE");
    }
}
