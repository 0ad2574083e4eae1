//! Sessions, ordered delivery and RPC over gamewire links.
//!
//! This is the "just works" layer. A [`SessionRuntime`] attaches connected
//! streams, runs the `CONNECT_REQUEST`/`CONNECT_RESPONSE` handshake, keeps
//! sessions alive with heartbeats, and correlates RPC requests with their
//! responses. With ordered delivery enabled, every message carries a
//! sequence and an ack so a session can resume over a new link without
//! losing or duplicating traffic.
//!
//! Each session is bound to one event loop for its whole life; its
//! pipeline, sequence state and pending calls are only touched there.

pub mod config;
pub mod error;
pub mod handshake;
pub mod listener;
mod manager;
pub mod pipeline;
mod rpc;
pub mod runtime;
pub mod sequence;
pub mod service;
pub mod session;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use handshake::{
    validate_identity, validate_request, validate_token, AcceptAll, HandshakeValidator,
    MAX_IDENTITY_LEN, MAX_SESSION_ID_LEN, MAX_TOKEN_LEN,
};
pub use listener::SessionListener;
pub use manager::{PipelineInitializer, SessionManager};
pub use pipeline::{
    Capability, Effect, Flow, Handler, HandlerContext, HandlerError, HandlerResult, Pipeline,
};
pub use runtime::{SessionHandle, SessionRuntime, SessionRuntimeBuilder, DEFAULT_RUNTIME_NAME};
pub use sequence::{Receipt, SequenceState};
pub use service::{CallContext, MethodHandler, Responder, ServiceError, ServiceRegistry};
pub use session::{Role, SessionInfo, SessionSnapshot, SessionState};
