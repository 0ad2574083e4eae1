//! Checksummed, length-prefixed framing for the gamewire session protocol.
//!
//! Every message on the wire is one frame:
//! - A 4-byte little-endian length (everything after the length field)
//! - A 1-byte message type
//! - The type-specific payload (fixed head, then opaque body)
//! - A 4-byte little-endian CRC-32 over the payload
//!
//! The checksum is validated before the type byte is interpreted. A bad
//! checksum or an unknown type is fatal to the connection; a payload that
//! fails to parse is reported per message so the session can drop it and
//! carry on (handshake messages excepted).

pub mod codec;
#[cfg(feature = "async")]
pub mod codec_async;
pub mod error;
pub mod kind;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, encode_message, FrameConfig, RawFrame, CHECKSUM_SIZE,
    DEFAULT_MAX_FRAME, LENGTH_SIZE, MIN_FRAME_LEN,
};
#[cfg(feature = "async")]
pub use codec_async::WireCodec;
pub use error::{BodyError, FrameError, ReadError, Result};
pub use kind::MessageKind;
pub use message::{
    Body, ConnectRequest, ConnectResponse, Message, OneWay, ResultCode, RpcRequest, RpcResponse,
    SequencedMessage,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
