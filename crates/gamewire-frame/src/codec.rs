use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BodyError, FrameError, Result};
use crate::kind::MessageKind;
use crate::message::Message;

/// Length prefix: 4 bytes, little-endian.
pub const LENGTH_SIZE: usize = 4;

/// Type byte.
pub const TYPE_SIZE: usize = 1;

/// CRC-32 trailer: 4 bytes, little-endian.
pub const CHECKSUM_SIZE: usize = 4;

/// Smallest legal value of the length field (type + checksum, empty payload).
pub const MIN_FRAME_LEN: usize = TYPE_SIZE + CHECKSUM_SIZE;

/// Default maximum frame size (value of the length field): 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// A checksum-validated frame whose payload has not been parsed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl RawFrame {
    /// Parse the payload into a typed message.
    pub fn message(&self) -> std::result::Result<Message, BodyError> {
        Message::decode(self.kind, self.payload.clone())
    }

    /// `(sequence, ack)` of a sequenced frame, read without parsing the
    /// body. Lets a receiver account for a message whose body is unusable.
    pub fn sequence_head(&self) -> Option<(u64, u64)> {
        if !self.kind.is_sequenced() || self.payload.len() < 16 {
            return None;
        }
        let mut head = &self.payload[..16];
        Some((head.get_u64_le(), head.get_u64_le()))
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        LENGTH_SIZE + MIN_FRAME_LEN + self.payload.len()
    }
}

/// Encode a frame whose payload is the concatenation of `parts`.
///
/// Wire format:
/// ```text
/// ┌────────────┬────────┬──────────────────────┬────────────┐
/// │ Length     │ Type   │ Payload              │ CRC-32     │
/// │ (4B LE)    │ (1B)   │ (Length - 5 bytes)   │ (4B LE)    │
/// └────────────┴────────┴──────────────────────┴────────────┘
/// ```
///
/// The length and checksum are computed last, over the assembled payload,
/// so a head and a body produced independently can be passed as two parts.
pub fn encode_frame(kind: MessageKind, parts: &[&[u8]], dst: &mut BytesMut) -> Result<()> {
    let payload_len: usize = parts.iter().map(|part| part.len()).sum();
    let frame_len = MIN_FRAME_LEN + payload_len;
    if frame_len > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: u32::MAX as usize,
        });
    }

    dst.reserve(LENGTH_SIZE + frame_len);
    let start = dst.len();
    dst.put_u32_le(0);
    dst.put_u8(kind.code());
    let payload_start = dst.len();
    for part in parts {
        dst.put_slice(part);
    }
    let checksum = crc32fast::hash(&dst[payload_start..]);
    dst.put_u32_le(checksum);

    let written = (dst.len() - start - LENGTH_SIZE) as u32;
    dst[start..start + LENGTH_SIZE].copy_from_slice(&written.to_le_bytes());
    Ok(())
}

/// Encode a typed message into the wire format.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let mut head = BytesMut::with_capacity(64);
    message.encode_head(&mut head);
    encode_frame(message.kind(), &[&head[..], message.body_bytes()], dst)
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. The checksum is
/// verified before the type byte is looked up.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<RawFrame>> {
    if src.len() < LENGTH_SIZE {
        return Ok(None);
    }

    let mut len_bytes = [0u8; LENGTH_SIZE];
    len_bytes.copy_from_slice(&src[..LENGTH_SIZE]);
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len < MIN_FRAME_LEN {
        return Err(FrameError::FrameTooShort(frame_len));
    }
    if frame_len > max_frame {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: max_frame,
        });
    }
    if src.len() < LENGTH_SIZE + frame_len {
        return Ok(None);
    }

    src.advance(LENGTH_SIZE);
    let mut frame = src.split_to(frame_len).freeze();

    let type_byte = frame.get_u8();
    let payload = frame.split_to(frame.len() - CHECKSUM_SIZE);
    let expected = frame.get_u32_le();
    let actual = crc32fast::hash(&payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let kind = MessageKind::from_code(type_byte).ok_or(FrameError::UnknownMessageType(type_byte))?;
    Ok(Some(RawFrame { kind, payload }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum value of the length field. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, ConnectResponse, OneWay, SequencedMessage};

    fn one_way(seq: u64, body: &'static [u8]) -> Message {
        Message::Sequenced(SequencedMessage {
            sequence: seq,
            ack: 0,
            body: Body::OneWay(OneWay {
                service_id: 1,
                method_id: 2,
                body: Bytes::from_static(body),
            }),
        })
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let message = one_way(1, b"hello, gamewire!");
        encode_message(&message, &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(frame.kind, MessageKind::OneWay);
        assert_eq!(frame.message().unwrap(), message);
        assert!(buf.is_empty());
    }

    #[test]
    fn sequence_head_survives_a_truncated_body() {
        let mut payload = BytesMut::new();
        payload.put_u64_le(7);
        payload.put_u64_le(3);
        payload.put_u8(0xff);
        let frame = RawFrame {
            kind: MessageKind::RpcRequest,
            payload: payload.freeze(),
        };
        assert!(frame.message().is_err());
        assert_eq!(frame.sequence_head(), Some((7, 3)));

        let ping = RawFrame {
            kind: MessageKind::Ping,
            payload: Bytes::from_static(&[0; 16]),
        };
        assert_eq!(ping.sequence_head(), None);
    }

    #[test]
    fn length_field_covers_type_payload_and_checksum() {
        let mut buf = BytesMut::new();
        encode_frame(MessageKind::Ping, &[[1u8, 2, 3].as_slice()], &mut buf).unwrap();
        assert_eq!(buf.len(), LENGTH_SIZE + MIN_FRAME_LEN + 3);
        assert_eq!(&buf[..4], &(8u32).to_le_bytes());
        assert_eq!(buf[4], MessageKind::Ping.code());
    }

    #[test]
    fn parts_concatenate_like_a_single_payload() {
        let mut split = BytesMut::new();
        let parts = [b"head".as_slice(), b"body".as_slice()];
        encode_frame(MessageKind::OneWay, &parts, &mut split).unwrap();
        let mut whole = BytesMut::new();
        encode_frame(MessageKind::OneWay, &[b"headbody".as_slice()], &mut whole).unwrap();
        assert_eq!(split, whole);
    }

    #[test]
    fn decode_incomplete_length() {
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_message(&one_way(1, b"hello"), &mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut buf = BytesMut::new();
        encode_message(&one_way(1, b"payload"), &mut buf).unwrap();
        let idx = LENGTH_SIZE + TYPE_SIZE + 3;
        buf[idx] ^= 0x01;

        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn checksum_is_checked_before_type() {
        let mut buf = BytesMut::new();
        encode_frame(MessageKind::Ping, &[0u64.to_le_bytes().as_slice()], &mut buf).unwrap();
        buf[LENGTH_SIZE] = 0xEE;
        let frame = decode_frame(&mut buf.clone(), DEFAULT_MAX_FRAME);
        assert!(matches!(frame, Err(FrameError::UnknownMessageType(0xEE))));

        // Corrupt the payload as well: the checksum error wins.
        buf[LENGTH_SIZE + TYPE_SIZE] ^= 0xFF;
        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn decode_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1024 * 1024 * 32);
        buf.put_u8(1);

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn decode_frame_too_short() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_slice(&[6, 0, 0]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(FrameError::FrameTooShort(3))));
    }

    #[test]
    fn multiple_frames() {
        let mut buf = BytesMut::new();
        encode_message(&one_way(1, b"first"), &mut buf).unwrap();
        let response = Message::ConnectResponse(ConnectResponse::rejected(2, "busy"));
        encode_message(&response, &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(f1.message().unwrap().sequence(), Some(1));
        assert_eq!(f2.message().unwrap(), response);
        assert!(buf.is_empty());
    }

    #[test]
    fn raw_frame_wire_size() {
        let mut buf = BytesMut::new();
        encode_message(&Message::Pong { ack: 4 }, &mut buf).unwrap();
        let wire_len = buf.len();
        let frame = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(frame.wire_size(), wire_len);
    }
}
