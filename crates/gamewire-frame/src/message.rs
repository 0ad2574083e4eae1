//! The message catalog and its payload layouts.
//!
//! All integers are little-endian. Strings and byte fields inside a head are
//! `u32` length-prefixed. RPC and one-way bodies are opaque and run to the
//! end of the payload.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::MIN_FRAME_LEN;
use crate::error::BodyError;
use crate::kind::MessageKind;

/// Sequence and ack fields that open every sequenced payload.
const SEQUENCE_HEAD_LEN: usize = 16;

/// Outcome carried by an `RPC_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    NoSuchMethod,
    HandlerFailed,
    BadRequest,
    ShuttingDown,
    Other(u16),
}

impl ResultCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::NoSuchMethod,
            2 => Self::HandlerFailed,
            3 => Self::BadRequest,
            4 => Self::ShuttingDown,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::NoSuchMethod => 1,
            Self::HandlerFailed => 2,
            Self::BadRequest => 3,
            Self::ShuttingDown => 4,
            Self::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::NoSuchMethod => f.write_str("no such method"),
            Self::HandlerFailed => f.write_str("handler failed"),
            Self::BadRequest => f.write_str("bad request"),
            Self::ShuttingDown => f.write_str("shutting down"),
            Self::Other(code) => write!(f, "code {code}"),
        }
    }
}

/// Opens (or resumes) a session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Initiator identity, e.g. `scene-3`.
    pub identity: String,
    /// Empty on a fresh connect; the responder-assigned id when resuming.
    pub session_id: String,
    /// Bumped on every (re)connection attempt.
    pub attempt: u32,
    /// Next sequence the initiator will send.
    pub sequence: u64,
    /// Highest contiguous sequence the initiator has received.
    pub ack: u64,
    /// Opaque credential material. Redacted in debug output.
    pub token: Bytes,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("identity", &self.identity)
            .field("session_id", &self.session_id)
            .field("attempt", &self.attempt)
            .field("sequence", &self.sequence)
            .field("ack", &self.ack)
            .field(
                "token",
                &format_args!("<redacted:{} bytes>", self.token.len()),
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub success: bool,
    /// Mirrors the attempt counter of the request being answered.
    pub attempt: u32,
    pub sequence: u64,
    pub ack: u64,
    pub session_id: String,
    /// Empty on success.
    pub reason: String,
}

impl ConnectResponse {
    pub fn accepted(attempt: u32, sequence: u64, ack: u64, session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            attempt,
            sequence,
            ack,
            session_id: session_id.into(),
            reason: String::new(),
        }
    }

    pub fn rejected(attempt: u32, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            attempt,
            sequence: 0,
            ack: 0,
            session_id: String::new(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub request_id: u64,
    /// Set when the caller is parked waiting on the response.
    pub sync: bool,
    pub service_id: u16,
    pub method_id: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub request_id: u64,
    pub code: ResultCode,
    /// Result bytes, or UTF-8 error text when `code` is not `Ok`.
    pub body: Bytes,
}

impl RpcResponse {
    pub fn ok(request_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            code: ResultCode::Ok,
            body: body.into(),
        }
    }

    pub fn error(request_id: u64, code: ResultCode, text: impl Into<String>) -> Self {
        Self {
            request_id,
            code,
            body: Bytes::from(text.into()),
        }
    }

    /// The error text for failed responses.
    pub fn error_text(&self) -> Option<String> {
        if self.code.is_ok() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.body).into_owned())
    }
}

/// Fire-and-forget message; no request id, never answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneWay {
    pub service_id: u16,
    pub method_id: u16,
    pub body: Bytes,
}

/// Application payload of a sequenced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(RpcRequest),
    Response(RpcResponse),
    OneWay(OneWay),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::RpcRequest,
            Self::Response(_) => MessageKind::RpcResponse,
            Self::OneWay(_) => MessageKind::OneWay,
        }
    }

    /// Length field of the frame this body encodes to once sequenced.
    pub fn frame_len(&self) -> usize {
        let (head, body) = match self {
            Self::Request(req) => (8 + 1 + 2 + 2, req.body.len()),
            Self::Response(resp) => (8 + 2, resp.body.len()),
            Self::OneWay(one_way) => (2 + 2, one_way.body.len()),
        };
        MIN_FRAME_LEN + SEQUENCE_HEAD_LEN + head + body
    }
}

/// Application traffic stamped by the ordered-delivery overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedMessage {
    pub sequence: u64,
    /// Highest contiguous sequence the sender has received from its peer.
    pub ack: u64,
    pub body: Body,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Sequenced(SequencedMessage),
    Ping { ack: u64 },
    Pong { ack: u64 },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectRequest(_) => MessageKind::ConnectRequest,
            Self::ConnectResponse(_) => MessageKind::ConnectResponse,
            Self::Sequenced(msg) => msg.body.kind(),
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
        }
    }

    /// The piggybacked acknowledgement, when the message carries one.
    pub fn ack(&self) -> Option<u64> {
        match self {
            Self::ConnectRequest(req) => Some(req.ack),
            Self::ConnectResponse(resp) if resp.success => Some(resp.ack),
            Self::ConnectResponse(_) => None,
            Self::Sequenced(msg) => Some(msg.ack),
            Self::Ping { ack } | Self::Pong { ack } => Some(*ack),
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Sequenced(msg) => Some(msg.sequence),
            _ => None,
        }
    }

    /// Write the fixed-layout head.
    pub fn encode_head(&self, dst: &mut BytesMut) {
        match self {
            Self::ConnectRequest(req) => {
                put_str(dst, &req.identity);
                put_str(dst, &req.session_id);
                dst.put_u32_le(req.attempt);
                dst.put_u64_le(req.sequence);
                dst.put_u64_le(req.ack);
                put_bytes(dst, &req.token);
            }
            Self::ConnectResponse(resp) => {
                dst.put_u8(u8::from(resp.success));
                dst.put_u32_le(resp.attempt);
                dst.put_u64_le(resp.sequence);
                dst.put_u64_le(resp.ack);
                put_str(dst, &resp.session_id);
                put_str(dst, &resp.reason);
            }
            Self::Sequenced(msg) => {
                dst.put_u64_le(msg.sequence);
                dst.put_u64_le(msg.ack);
                match &msg.body {
                    Body::Request(req) => {
                        dst.put_u64_le(req.request_id);
                        dst.put_u8(u8::from(req.sync));
                        dst.put_u16_le(req.service_id);
                        dst.put_u16_le(req.method_id);
                    }
                    Body::Response(resp) => {
                        dst.put_u64_le(resp.request_id);
                        dst.put_u16_le(resp.code.as_u16());
                    }
                    Body::OneWay(one_way) => {
                        dst.put_u16_le(one_way.service_id);
                        dst.put_u16_le(one_way.method_id);
                    }
                }
            }
            Self::Ping { ack } | Self::Pong { ack } => dst.put_u64_le(*ack),
        }
    }

    /// The opaque body that follows the head (empty for control messages).
    pub fn body_bytes(&self) -> &[u8] {
        match self {
            Self::Sequenced(msg) => match &msg.body {
                Body::Request(req) => &req.body,
                Body::Response(resp) => &resp.body,
                Body::OneWay(one_way) => &one_way.body,
            },
            _ => &[],
        }
    }

    /// Parse a checksum-valid payload of the given kind.
    pub fn decode(kind: MessageKind, payload: Bytes) -> Result<Self, BodyError> {
        let mut head = HeadReader { kind, buf: payload };
        let message = match kind {
            MessageKind::ConnectRequest => {
                let req = ConnectRequest {
                    identity: head.string()?,
                    session_id: head.string()?,
                    attempt: head.u32()?,
                    sequence: head.u64()?,
                    ack: head.u64()?,
                    token: head.bytes()?,
                };
                head.finish()?;
                Self::ConnectRequest(req)
            }
            MessageKind::ConnectResponse => {
                let resp = ConnectResponse {
                    success: head.flag()?,
                    attempt: head.u32()?,
                    sequence: head.u64()?,
                    ack: head.u64()?,
                    session_id: head.string()?,
                    reason: head.string()?,
                };
                head.finish()?;
                Self::ConnectResponse(resp)
            }
            MessageKind::RpcRequest => {
                let (sequence, ack) = (head.u64()?, head.u64()?);
                let request_id = head.u64()?;
                let sync = head.flag()?;
                let service_id = head.u16()?;
                let method_id = head.u16()?;
                Self::Sequenced(SequencedMessage {
                    sequence,
                    ack,
                    body: Body::Request(RpcRequest {
                        request_id,
                        sync,
                        service_id,
                        method_id,
                        body: head.rest(),
                    }),
                })
            }
            MessageKind::RpcResponse => {
                let (sequence, ack) = (head.u64()?, head.u64()?);
                let request_id = head.u64()?;
                let code = ResultCode::from_u16(head.u16()?);
                Self::Sequenced(SequencedMessage {
                    sequence,
                    ack,
                    body: Body::Response(RpcResponse {
                        request_id,
                        code,
                        body: head.rest(),
                    }),
                })
            }
            MessageKind::OneWay => {
                let (sequence, ack) = (head.u64()?, head.u64()?);
                let service_id = head.u16()?;
                let method_id = head.u16()?;
                Self::Sequenced(SequencedMessage {
                    sequence,
                    ack,
                    body: Body::OneWay(OneWay {
                        service_id,
                        method_id,
                        body: head.rest(),
                    }),
                })
            }
            MessageKind::Ping => {
                let ack = head.u64()?;
                head.finish()?;
                Self::Ping { ack }
            }
            MessageKind::Pong => {
                let ack = head.u64()?;
                head.finish()?;
                Self::Pong { ack }
            }
        };
        Ok(message)
    }
}

fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value);
}

struct HeadReader {
    kind: MessageKind,
    buf: Bytes,
}

impl HeadReader {
    fn need(&self, n: usize) -> Result<(), BodyError> {
        if self.buf.remaining() < n {
            return Err(BodyError::new(
                self.kind,
                format!(
                    "truncated head: need {n} bytes, have {}",
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, BodyError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, BodyError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, BodyError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn flag(&mut self) -> Result<bool, BodyError> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BodyError::new(
                self.kind,
                format!("invalid flag byte {other:#04x}"),
            )),
        }
    }

    fn bytes(&mut self) -> Result<Bytes, BodyError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String, BodyError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| BodyError::new(self.kind, format!("invalid utf-8 string: {err}")))
    }

    fn rest(self) -> Bytes {
        self.buf
    }

    fn finish(self) -> Result<(), BodyError> {
        if self.buf.has_remaining() {
            return Err(BodyError::new(
                self.kind,
                format!("{} trailing bytes", self.buf.remaining()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_only(message: &Message) -> Bytes {
        let mut buf = BytesMut::new();
        message.encode_head(&mut buf);
        buf.put_slice(message.body_bytes());
        buf.freeze()
    }

    #[test]
    fn frame_len_matches_encoder() {
        let bodies = [
            Body::Request(RpcRequest {
                request_id: 9,
                sync: true,
                service_id: 10,
                method_id: 5,
                body: Bytes::from_static(b"args"),
            }),
            Body::Response(RpcResponse::ok(9, Bytes::from_static(b"ok"))),
            Body::OneWay(OneWay {
                service_id: 1,
                method_id: 2,
                body: Bytes::new(),
            }),
        ];
        for body in bodies {
            let expected = body.frame_len();
            let message = Message::Sequenced(SequencedMessage {
                sequence: 1,
                ack: 0,
                body,
            });
            let mut buf = BytesMut::new();
            crate::codec::encode_message(&message, &mut buf).unwrap();
            assert_eq!(buf.len(), crate::codec::LENGTH_SIZE + expected);
        }
    }

    #[test]
    fn connect_request_payload_roundtrip() {
        let message = Message::ConnectRequest(ConnectRequest {
            identity: "scene-3".to_string(),
            session_id: String::new(),
            attempt: 1,
            sequence: 1,
            ack: 0,
            token: Bytes::from_static(b"opaque"),
        });
        let decoded = Message::decode(MessageKind::ConnectRequest, head_only(&message)).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.ack(), Some(0));
        assert_eq!(decoded.sequence(), None);
    }

    #[test]
    fn rpc_request_body_runs_to_end() {
        let message = Message::Sequenced(SequencedMessage {
            sequence: 7,
            ack: 3,
            body: Body::Request(RpcRequest {
                request_id: 42,
                sync: true,
                service_id: 10,
                method_id: 5,
                body: Bytes::from_static(b"{\"x\":1}"),
            }),
        });
        let decoded = Message::decode(MessageKind::RpcRequest, head_only(&message)).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), MessageKind::RpcRequest);
        assert_eq!(decoded.sequence(), Some(7));
    }

    #[test]
    fn truncated_head_is_body_error() {
        let err = Message::decode(MessageKind::RpcResponse, Bytes::from_static(&[1, 2, 3]))
            .unwrap_err();
        assert_eq!(err.kind, MessageKind::RpcResponse);
        assert!(err.detail.contains("truncated"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn handshake_body_errors_are_fatal() {
        let err = Message::decode(MessageKind::ConnectResponse, Bytes::from_static(&[9]))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.detail.contains("invalid flag"));
    }

    #[test]
    fn ping_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(5);
        buf.put_u8(0);
        let err = Message::decode(MessageKind::Ping, buf.freeze()).unwrap_err();
        assert!(err.detail.contains("trailing"));
    }

    #[test]
    fn invalid_utf8_identity_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        let err = Message::decode(MessageKind::ConnectRequest, buf.freeze()).unwrap_err();
        assert!(err.detail.contains("utf-8"));
    }

    #[test]
    fn error_response_text() {
        let resp = RpcResponse::error(9, ResultCode::NoSuchMethod, "no handler for 10/6");
        assert_eq!(resp.error_text().as_deref(), Some("no handler for 10/6"));
        assert!(RpcResponse::ok(9, "ok").error_text().is_none());
        assert_eq!(ResultCode::from_u16(77), ResultCode::Other(77));
        assert_eq!(ResultCode::Other(77).as_u16(), 77);
    }

    #[test]
    fn connect_request_debug_redacts_token() {
        let req = ConnectRequest {
            identity: "gate-1".to_string(),
            session_id: String::new(),
            attempt: 1,
            sequence: 1,
            ack: 0,
            token: Bytes::from_static(b"super-secret"),
        };
        let debug = format!("{req:?}");
        assert!(debug.contains("<redacted:12 bytes>"));
        assert!(!debug.contains("super-secret"));
    }
}
