//! `tokio_util::codec` adapter for async transports.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_message, RawFrame, DEFAULT_MAX_FRAME};
use crate::error::FrameError;
use crate::message::Message;

/// Frame codec for `tokio_util::codec::Framed`.
///
/// Decodes to checksum-validated [`RawFrame`]s; parsing the payload is left to
/// the caller so a malformed body does not tear down the stream.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_frame_size: usize,
}

impl WireCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for WireCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_frame_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Message>::encode(self, &item, dst)
    }
}

impl<'a> Encoder<&'a Message> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let before = dst.len();
        encode_message(item, dst)?;
        let frame_len = dst.len() - before - crate::codec::LENGTH_SIZE;
        if frame_len > self.max_frame_size {
            dst.truncate(before);
            return Err(FrameError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::message::{Body, RpcResponse, SequencedMessage};

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(client, WireCodec::default());
        let mut stream = FramedRead::new(server, WireCodec::default());

        let response = Message::Sequenced(SequencedMessage {
            sequence: 7,
            ack: 3,
            body: Body::Response(RpcResponse::ok(42, Bytes::from_static(b"pong"))),
        });
        sink.send(response.clone()).await.unwrap();
        sink.send(Message::Ping { ack: 7 }).await.unwrap();
        drop(sink);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message().unwrap(), response);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message().unwrap(), Message::Ping { ack: 7 });
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn truncated_tail_at_eof_is_an_error() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        Encoder::<&Message>::encode(&mut codec, &Message::Pong { ack: 1 }, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn encoder_enforces_max_frame() {
        let mut codec = WireCodec::new(8);
        let mut buf = BytesMut::new();
        let big = Message::Sequenced(SequencedMessage {
            sequence: 1,
            ack: 0,
            body: Body::Response(RpcResponse::ok(1, vec![0u8; 64])),
        });
        let err = Encoder::<&Message>::encode(&mut codec, &big, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }
}
