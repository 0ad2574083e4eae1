use std::time::Duration;

use gamewire_frame::{BodyError, FrameError, ResultCode};
use gamewire_loop::{LoopError, RejectReason};
use gamewire_transport::TransportError;

/// Errors surfaced by sessions, calls and the runtime.
///
/// Cloneable so a single failure can complete every completion observing it.
/// Lower-layer errors are captured as their display text for that reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame-level error. Always fatal to the link it was raised on.
    #[error("frame error: {0}")]
    Frame(String),

    /// The responder refused the handshake, or the request was malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A handshake response did not answer the latest attempt.
    #[error("handshake response mismatch: {0}")]
    HandshakeMismatch(String),

    /// The peer broke the sequencing or handshake rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A call, handshake or idle session ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The session is gone, or went away while the operation was pending.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// A bounded buffer or ring had no room left.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The remote handler answered with a non-OK result code.
    #[error("remote call failed ({code}): {message}")]
    Remote { code: ResultCode, message: String },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(String),

    /// Invalid runtime or session configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `(service_id, method_id)` was registered twice.
    #[error("method {service_id}:{method_id} is already registered")]
    DuplicateMethod { service_id: u16, method_id: u16 },

    /// A pipeline already holds a handler with this name.
    #[error("pipeline already has a handler named '{0}'")]
    DuplicateHandler(String),

    /// The owning event loop refused the task.
    #[error(transparent)]
    Loop(LoopError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Result code of a [`SessionError::Remote`] failure.
    pub fn remote_code(&self) -> Option<ResultCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub(crate) fn abandoned() -> Self {
        Self::SessionClosed("operation dropped before completion".to_string())
    }
}

impl From<LoopError> for SessionError {
    fn from(err: LoopError) -> Self {
        match err.reject_reason() {
            Some(RejectReason::CapacityExceeded) => Self::CapacityExceeded(err.to_string()),
            _ => Self::Loop(err),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err.to_string())
    }
}

impl From<BodyError> for SessionError {
    fn from(err: BodyError) -> Self {
        if err.is_fatal() {
            Self::HandshakeFailed(err.to_string())
        } else {
            Self::Frame(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
