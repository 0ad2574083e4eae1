use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, encode_message, FrameConfig, RawFrame};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// `feed` only encodes into the internal buffer; `flush` pushes everything
/// buffered so far in one pass. `send` does both.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write one message, then flush (blocking).
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.feed(message)?;
        self.flush()
    }

    /// Re-emit an already validated frame.
    pub fn write_frame(&mut self, frame: &RawFrame) -> Result<()> {
        self.check_size(frame.payload.len())?;
        encode_frame(frame.kind, &[&frame.payload[..]], &mut self.buf)?;
        self.flush()
    }

    /// Encode a message into the pending buffer without writing it.
    pub fn feed(&mut self, message: &Message) -> Result<()> {
        let before = self.buf.len();
        encode_message(message, &mut self.buf)?;
        let frame_len = self.buf.len() - before - crate::codec::LENGTH_SIZE;
        if frame_len > self.config.max_frame_size {
            self.buf.truncate(before);
            return Err(FrameError::FrameTooLarge {
                size: frame_len,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }

    /// Bytes encoded but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Write everything buffered and flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.buf.clear();

        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn check_size(&self, payload_len: usize) -> Result<()> {
        let frame_len = crate::codec::MIN_FRAME_LEN + payload_len;
        if frame_len > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: frame_len,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream. Unflushed bytes are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::codec::decode_frame;
    use crate::kind::MessageKind;
    use crate::message::{Body, RpcRequest, SequencedMessage};

    fn request(seq: u64, body: &'static [u8]) -> Message {
        Message::Sequenced(SequencedMessage {
            sequence: seq,
            ack: 0,
            body: Body::Request(RpcRequest {
                request_id: seq,
                sync: false,
                service_id: 10,
                method_id: 5,
                body: Bytes::from_static(body),
            }),
        })
    }

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[test]
    fn send_writes_decodable_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(&request(1, b"hello")).unwrap();

        let mut wire = written(writer);
        let frame = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(frame.message().unwrap(), request(1, b"hello"));
    }

    #[test]
    fn feed_coalesces_until_flush() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.feed(&request(1, b"a")).unwrap();
        writer.feed(&request(2, b"b")).unwrap();
        assert!(writer.get_ref().get_ref().is_empty());
        assert!(writer.pending_bytes() > 0);

        writer.flush().unwrap();
        assert_eq!(writer.pending_bytes(), 0);

        let mut wire = written(writer);
        let f1 = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        let f2 = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(f1.message().unwrap().sequence(), Some(1));
        assert_eq!(f2.message().unwrap().sequence(), Some(2));
    }

    #[test]
    fn frame_too_large_rejected_without_corrupting_buffer() {
        let cfg = FrameConfig {
            max_frame_size: 16,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.feed(&request(1, b"far too large for sixteen")).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert_eq!(writer.pending_bytes(), 0);
    }

    #[test]
    fn write_frame_reemits_raw_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let raw = RawFrame {
            kind: MessageKind::Pong,
            payload: Bytes::copy_from_slice(&3u64.to_le_bytes()),
        };
        writer.write_frame(&raw).unwrap();

        let mut wire = written(writer);
        let decoded = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(&Message::Ping { ack: 0 }).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn handles_interrupted_and_would_block() {
        let mut writer = FrameWriter::new(FlakyWriter {
            hiccups: vec![ErrorKind::Interrupted, ErrorKind::WouldBlock],
            data: Vec::new(),
        });
        writer.send(&Message::Pong { ack: 1 }).unwrap();
        assert!(!writer.into_inner().data.is_empty());
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(&Message::Ping { ack: 0 }).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyWriter {
        hiccups: Vec<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.hiccups.pop() {
                return Err(std::io::Error::from(kind));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
