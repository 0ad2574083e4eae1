use crate::kind::MessageKind;

/// Errors that can occur during frame encoding/decoding.
///
/// Every variant is fatal to the connection it was raised on.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload checksum did not match the trailer.
    #[error("frame checksum mismatch (expected {expected:#010x}, computed {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The checksum validated but the type byte names no known message.
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The length field is smaller than type + checksum.
    #[error("frame too short (length field {0})")]
    FrameTooShort(usize),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A checksum-valid frame whose payload could not be parsed.
///
/// Recoverable for everything except handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to decode {kind} body: {detail}")]
pub struct BodyError {
    pub kind: MessageKind,
    pub detail: String,
}

impl BodyError {
    pub(crate) fn new(kind: MessageKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Whether the connection must be closed because of this error.
    pub fn is_fatal(&self) -> bool {
        self.kind.is_handshake()
    }
}

/// Error from reading a fully parsed message off a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Body(#[from] BodyError),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Frame(FrameError::Io(err))
    }
}
