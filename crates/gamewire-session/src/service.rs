//! The `(service_id, method_id) → handler` registration boundary.
//!
//! Generated stubs or hand-written glue register plain functions here; the
//! runtime dispatches `RPC_REQUEST` and `ONE_WAY` bodies to them on the
//! session's event loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use gamewire_frame::{ResultCode, RpcResponse};
use gamewire_loop::EventLoop;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SessionError};
use crate::manager::SessionManager;
use crate::session::SessionInfo;

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session: SessionInfo,
    pub service_id: u16,
    pub method_id: u16,
    /// `None` for one-way messages.
    pub request_id: Option<u64>,
    /// The caller is blocked waiting for the answer.
    pub sync: bool,
}

/// A registered method. Runs on the session's event loop; long work should
/// move the [`Responder`] to another thread and answer from there.
pub type MethodHandler = Arc<dyn Fn(&CallContext, Bytes, Responder) + Send + Sync>;

/// A typed failure returned by JSON handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ResultCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResultCode::HandlerFailed, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ResultCode::BadRequest, message)
    }
}

/// Method table shared by every session of a runtime.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    methods: HashMap<(u16, u16), MethodHandler>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler.
    pub fn register<F>(&mut self, service_id: u16, method_id: u16, handler: F) -> Result<()>
    where
        F: Fn(&CallContext, Bytes, Responder) + Send + Sync + 'static,
    {
        let key = (service_id, method_id);
        if self.methods.contains_key(&key) {
            return Err(SessionError::DuplicateMethod {
                service_id,
                method_id,
            });
        }
        self.methods.insert(key, Arc::new(handler));
        Ok(())
    }

    /// Register a handler with JSON-encoded argument and result.
    ///
    /// Arguments that fail to decode are answered with `BadRequest`.
    pub fn register_json<Req, Resp, F>(
        &mut self,
        service_id: u16,
        method_id: u16,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(&CallContext, Req) -> std::result::Result<Resp, ServiceError> + Send + Sync + 'static,
    {
        self.register(service_id, method_id, move |ctx, body, responder| {
            let request: Req = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!(
                        service_id = ctx.service_id,
                        method_id = ctx.method_id,
                        error = %err,
                        "rejecting undecodable arguments"
                    );
                    responder.fail(ResultCode::BadRequest, format!("invalid arguments: {err}"));
                    return;
                }
            };
            match handler(ctx, request).map(|response| serde_json::to_vec(&response)) {
                Ok(Ok(encoded)) => responder.ok(encoded),
                Ok(Err(err)) => {
                    responder.fail(ResultCode::HandlerFailed, format!("invalid result: {err}"))
                }
                Err(err) => responder.fail(err.code, err.message),
            }
        })
    }

    pub fn contains(&self, service_id: u16, method_id: u16) -> bool {
        self.methods.contains_key(&(service_id, method_id))
    }

    /// Registered `(service_id, method_id)` pairs, sorted.
    pub fn methods(&self) -> Vec<(u16, u16)> {
        let mut methods: Vec<_> = self.methods.keys().copied().collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn lookup(&self, service_id: u16, method_id: u16) -> Option<MethodHandler> {
        self.methods.get(&(service_id, method_id)).cloned()
    }
}

struct Reply {
    event_loop: EventLoop<SessionManager>,
    session: u64,
    request_id: u64,
}

/// Answers one request. Can be moved to another thread.
///
/// Dropping an unanswered responder answers `HandlerFailed`, so a caller is
/// never left waiting on a handler that forgot to reply (or panicked).
/// Responders for one-way messages discard their answer.
pub struct Responder {
    reply: Option<Reply>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.reply.as_ref().map(|reply| reply.request_id))
            .finish()
    }
}

impl Responder {
    pub(crate) fn new(
        event_loop: EventLoop<SessionManager>,
        session: u64,
        request_id: u64,
    ) -> Self {
        Self {
            reply: Some(Reply {
                event_loop,
                session,
                request_id,
            }),
        }
    }

    pub(crate) fn one_way() -> Self {
        Self { reply: None }
    }

    /// Whether an answer will actually be sent.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn ok(mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.send(|request_id| RpcResponse::ok(request_id, body));
    }

    pub fn fail(mut self, code: ResultCode, text: impl Into<String>) {
        let text = text.into();
        self.send(|request_id| RpcResponse::error(request_id, code, text));
    }

    /// Serialize `value` as JSON and answer with it.
    pub fn json<T: Serialize>(self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(encoded) => self.ok(encoded),
            Err(err) => self.fail(ResultCode::HandlerFailed, format!("invalid result: {err}")),
        }
    }

    fn send(&mut self, make: impl FnOnce(u64) -> RpcResponse) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        let response = make(reply.request_id);
        let session = reply.session;
        if let Err(err) = reply
            .event_loop
            .submit(move |manager: &mut SessionManager| manager.respond(session, response))
        {
            tracing::warn!(
                request_id = reply.request_id,
                error = %err,
                "could not queue response"
            );
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.reply.is_some() {
            self.send(|request_id| {
                RpcResponse::error(
                    request_id,
                    ResultCode::HandlerFailed,
                    "handler finished without answering",
                )
            });
        }
    }
}
