//! The public face of a session endpoint.
//!
//! A [`SessionRuntime`] owns a group of event loops, each running a
//! [`SessionManager`]. Connected streams are attached either as a responder
//! (the peer will send `CONNECT_REQUEST`) or as an initiator (we send it).
//! Every link gets one reader thread that decodes frames and forwards them
//! to the owning loop; writes happen on the loop itself.
//!
//! Sessions are addressed through cloneable [`SessionHandle`]s. Every
//! handle operation is marshaled onto the session's loop, so handles can be
//! used from any thread.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use gamewire_frame::{
    ConnectRequest, FrameConfig, FrameError, FrameReader, Message, OneWay, ReadError,
};
use gamewire_loop::{Completion, EventLoop, EventLoopGroup, Promise};
use gamewire_transport::WireStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::handshake::{
    owning_loop, validate_identity, validate_token, AcceptAll, HandshakeValidator,
};
use crate::listener::SessionListener;
use crate::manager::{OutgoingCall, PipelineInitializer, SessionManager, Shared};
use crate::pipeline::{Handler, Pipeline};
use crate::service::ServiceRegistry;
use crate::session::{Link, SessionInfo, SessionSnapshot};

/// Extra time a synchronous caller waits past the call deadline, so the
/// loop's own timeout normally wins.
const SYNC_GRACE: Duration = Duration::from_secs(1);

/// Default name prefix for loop threads.
pub const DEFAULT_RUNTIME_NAME: &str = "gamewire";

/// Builder for [`SessionRuntime`].
pub struct SessionRuntimeBuilder {
    name: String,
    config: SessionConfig,
    registry: ServiceRegistry,
    validator: Arc<dyn HandshakeValidator>,
    listeners: Vec<Arc<dyn SessionListener>>,
    initializer: Option<PipelineInitializer>,
}

impl fmt::Debug for SessionRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRuntimeBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SessionRuntimeBuilder {
    /// Prefix for loop thread names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Decides which `CONNECT_REQUEST`s a responder accepts.
    pub fn validator(mut self, validator: impl HandshakeValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn listener(mut self, listener: impl SessionListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Install handlers on every session before it becomes active.
    pub fn pipeline<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&SessionInfo, &mut Pipeline) -> Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn build(self) -> Result<SessionRuntime> {
        self.config.validate()?;
        let threads = self.config.loop_threads;
        let options = self.config.loop_options();
        let shared = Arc::new(Shared::new(
            self.config,
            self.registry,
            self.validator,
            self.listeners,
            self.initializer,
        ));
        let factory_shared = Arc::clone(&shared);
        let group = EventLoopGroup::new(
            &self.name,
            threads,
            options,
            move |index, event_loop: &EventLoop<SessionManager>| {
                SessionManager::new(index, event_loop, Arc::clone(&factory_shared))
            },
        )?;
        tracing::debug!(name = %self.name, loops = threads, "session runtime built");
        Ok(SessionRuntime { group, shared })
    }
}

/// A session endpoint: event loops, method table and handshake policy.
pub struct SessionRuntime {
    group: EventLoopGroup<SessionManager>,
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("loops", &self.group.len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    /// A runtime that accepts every handshake and serves `registry`.
    pub fn new(config: SessionConfig, registry: ServiceRegistry) -> Result<Self> {
        Self::builder(config).registry(registry).build()
    }

    pub fn builder(config: SessionConfig) -> SessionRuntimeBuilder {
        SessionRuntimeBuilder {
            name: DEFAULT_RUNTIME_NAME.to_string(),
            config,
            registry: ServiceRegistry::new(),
            validator: Arc::new(AcceptAll),
            listeners: Vec::new(),
            initializer: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.shared.registry
    }

    /// Serve a connected stream whose peer will open (or resume) a session.
    ///
    /// Returns once the reader thread is running. The handshake itself
    /// completes in the background; refusals are logged and the stream is
    /// closed.
    pub fn attach_responder(&self, stream: WireStream) -> Result<()> {
        let (link, reader) = self.open_link(stream)?;
        let link_id = link.id;
        let loops = self.group.loops().to_vec();
        let fallback = self.group.next().clone();
        let handshake_timeout = self.shared.config.handshake_timeout();
        let frame_config = self.shared.config.frame_config();

        thread::Builder::new()
            .name(format!("gamewire-link-{link_id}"))
            .spawn(move || {
                let mut reader = FrameReader::with_config(reader, frame_config);
                let Some(request) = read_handshake(&mut reader, handshake_timeout, link_id) else {
                    link.close();
                    return;
                };
                // Resumes go back to the loop that owns the session.
                let event_loop = owning_loop(&request.session_id)
                    .and_then(|index| loops.get(index))
                    .cloned()
                    .unwrap_or(fallback);
                let accepted = event_loop
                    .submit(move |manager: &mut SessionManager| manager.accept(link, request));
                if let Err(err) = accepted {
                    tracing::warn!(link = link_id, error = %err, "could not hand link to a loop");
                    return;
                }
                pump(&event_loop, link_id, &mut reader);
            })?;
        Ok(())
    }

    /// Open a new session over a connected stream.
    ///
    /// The completion resolves with a handle once the responder accepts, or
    /// with the reason it did not.
    pub fn connect(
        &self,
        stream: WireStream,
        identity: &str,
        token: impl Into<Bytes>,
    ) -> Completion<SessionHandle, SessionError> {
        let token = token.into();
        if let Err(err) = validate_identity(identity).and_then(|()| validate_token(&token)) {
            return Completion::ready(Err(err));
        }
        let (link, reader) = match self.open_link(stream) {
            Ok(opened) => opened,
            Err(err) => return Completion::ready(Err(err)),
        };
        let promise = Promise::with_abandon_error(SessionError::abandoned);
        let completion = promise.completion();
        let identity = identity.to_string();
        let event_loop = self.group.next();
        match event_loop.submit(move |manager: &mut SessionManager| {
            manager.begin_connect(link, reader, identity, token, promise)
        }) {
            Ok(()) => completion,
            Err(err) => Completion::ready(Err(err.into())),
        }
    }

    /// Resume `session` over a new stream after its link was lost.
    ///
    /// Unacknowledged traffic is replayed once the responder accepts, so
    /// calls in flight survive the switch.
    pub fn reconnect(
        &self,
        session: &SessionHandle,
        stream: WireStream,
    ) -> Completion<SessionHandle, SessionError> {
        let (link, reader) = match self.open_link(stream) {
            Ok(opened) => opened,
            Err(err) => return Completion::ready(Err(err)),
        };
        let promise = Promise::with_abandon_error(SessionError::abandoned);
        let completion = promise.completion();
        let local_id = session.local_id;
        match session.event_loop.submit(move |manager: &mut SessionManager| {
            manager.begin_reconnect(local_id, link, reader, promise)
        }) {
            Ok(()) => completion,
            Err(err) => Completion::ready(Err(err.into())),
        }
    }

    /// Snapshot every session, waiting at most `timeout` per loop.
    pub fn sessions(&self, timeout: Duration) -> Vec<SessionSnapshot> {
        let pending: Vec<Completion<Vec<SessionSnapshot>, SessionError>> = self
            .group
            .loops()
            .iter()
            .map(|event_loop| {
                let promise = Promise::with_abandon_error(SessionError::abandoned);
                let completion = promise.completion();
                if let Err(err) = event_loop.submit(move |manager: &mut SessionManager| {
                    promise.try_success(manager.snapshot());
                }) {
                    tracing::debug!(error = %err, "loop not accepting snapshot requests");
                }
                completion
            })
            .collect();
        pending
            .iter()
            .filter_map(|completion| match completion.wait_timeout(timeout) {
                Some(Ok(snapshots)) => Some(snapshots.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Stop accepting work, close every session and wait up to `timeout`
    /// for the loops to finish. Returns whether they did.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        for event_loop in self.group.loops() {
            let submitted =
                event_loop.submit(|manager: &mut SessionManager| manager.begin_shutdown());
            if let Err(err) = submitted {
                tracing::debug!(
                    loop_name = event_loop.name(),
                    error = %err,
                    "loop already stopping"
                );
            }
        }
        self.group.shutdown_gracefully();
        let terminated = self.group.await_termination(timeout);
        tracing::info!(terminated, "session runtime shut down");
        terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.group.is_terminated()
    }

    fn open_link(&self, stream: WireStream) -> Result<(Link, WireStream)> {
        let reader = stream.try_clone()?;
        stream.set_write_timeout(Some(self.shared.config.session_timeout()))?;
        let link = Link::new(
            self.shared.next_link_id(),
            stream,
            self.shared.config.frame_config(),
        );
        Ok((link, reader))
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.group.shutdown_gracefully();
    }
}

/// Start the reader thread for an initiator link.
pub(crate) fn spawn_reader(
    event_loop: EventLoop<SessionManager>,
    link_id: u64,
    stream: WireStream,
    config: FrameConfig,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("gamewire-link-{link_id}"))
        .spawn(move || {
            let mut reader = FrameReader::with_config(stream, config);
            pump(&event_loop, link_id, &mut reader);
        })?;
    Ok(())
}

/// Read the first frame of a responder link, which must be a
/// `CONNECT_REQUEST` arriving within `timeout`.
fn read_handshake(
    reader: &mut FrameReader<WireStream>,
    timeout: Duration,
    link_id: u64,
) -> Option<ConnectRequest> {
    if let Err(err) = reader.get_ref().set_read_timeout(Some(timeout)) {
        tracing::warn!(link = link_id, error = %err, "could not arm handshake timeout");
        return None;
    }
    let outcome = reader.read_message();
    if let Err(err) = reader.get_ref().set_read_timeout(None) {
        tracing::warn!(link = link_id, error = %err, "could not clear handshake timeout");
        return None;
    }
    match outcome {
        Ok(Message::ConnectRequest(request)) => Some(request),
        Ok(other) => {
            tracing::warn!(
                link = link_id,
                kind = %other.kind(),
                "expected CONNECT_REQUEST; dropping link"
            );
            None
        }
        Err(ReadError::Frame(FrameError::Io(err)))
            if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            tracing::warn!(
                link = link_id,
                ?timeout,
                "no CONNECT_REQUEST before the handshake timeout"
            );
            None
        }
        Err(err) => {
            tracing::warn!(link = link_id, error = %err, "handshake read failed");
            None
        }
    }
}

/// Forward frames from `reader` to the loop until the link ends or the
/// loop stops taking work.
fn pump(
    event_loop: &EventLoop<SessionManager>,
    link_id: u64,
    reader: &mut FrameReader<WireStream>,
) {
    loop {
        let forwarded = match reader.read_frame() {
            Ok(frame) => match frame.message() {
                Ok(message) => event_loop.submit(move |manager: &mut SessionManager| {
                    manager.on_message(link_id, message)
                }),
                Err(error) => {
                    let head = frame.sequence_head();
                    event_loop.submit(move |manager: &mut SessionManager| {
                        manager.on_body_error(link_id, error, head)
                    })
                }
            },
            Err(err) => {
                let error = match err {
                    FrameError::ConnectionClosed => {
                        SessionError::SessionClosed("peer closed the connection".to_string())
                    }
                    other => SessionError::from(other),
                };
                tracing::debug!(link = link_id, error = %error, "link reader stopping");
                if let Err(err) = event_loop.submit(move |manager: &mut SessionManager| {
                    manager.on_link_failed(link_id, error)
                }) {
                    tracing::trace!(link = link_id, error = %err, "loop gone before link failure");
                }
                return;
            }
        };
        if let Err(err) = forwarded {
            tracing::debug!(
                link = link_id,
                error = %err,
                "loop not accepting work; reader stopping"
            );
            return;
        }
    }
}

/// A cloneable reference to one session.
///
/// Every operation is forwarded to the session's event loop. Once the
/// session closes, calls fail with [`SessionError::SessionClosed`].
#[derive(Clone)]
pub struct SessionHandle {
    event_loop: EventLoop<SessionManager>,
    local_id: u64,
    session_id: Arc<str>,
    identity: Arc<str>,
    rpc_timeout: Duration,
    sync_timeout: Duration,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("identity", &self.identity)
            .field("loop", &self.event_loop.name())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        event_loop: EventLoop<SessionManager>,
        info: &SessionInfo,
        config: &SessionConfig,
    ) -> Self {
        Self {
            event_loop,
            local_id: info.local_id,
            session_id: Arc::from(info.session_id.as_str()),
            identity: Arc::from(info.identity.as_str()),
            rpc_timeout: config.rpc_callback_timeout(),
            sync_timeout: config.sync_rpc_timeout(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Id of the session within its loop.
    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Issue a call with the configured callback timeout.
    pub fn call_async(
        &self,
        service_id: u16,
        method_id: u16,
        body: impl Into<Bytes>,
    ) -> Completion<Bytes, SessionError> {
        self.issue(service_id, method_id, body.into(), false, self.rpc_timeout)
    }

    pub fn call_async_with_timeout(
        &self,
        service_id: u16,
        method_id: u16,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Completion<Bytes, SessionError> {
        self.issue(service_id, method_id, body.into(), false, timeout)
    }

    /// Issue a call and block for its answer, up to the sync timeout.
    ///
    /// Must not be called from a handler or listener running on this
    /// session's loop; the loop could not process the answer, and the call
    /// would end in [`SessionError::Timeout`].
    pub fn call_sync(
        &self,
        service_id: u16,
        method_id: u16,
        body: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let completion = self.issue(service_id, method_id, body.into(), true, self.sync_timeout);
        match completion.wait_timeout(self.sync_timeout + SYNC_GRACE) {
            Some(result) => result.clone(),
            None => Err(SessionError::Timeout(self.sync_timeout)),
        }
    }

    /// [`call_async`](Self::call_async) with JSON-encoded argument and
    /// result.
    pub fn call_json<Req, Resp>(
        &self,
        service_id: u16,
        method_id: u16,
        request: &Req,
    ) -> Completion<Resp, SessionError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + Sync + 'static,
    {
        let body = match serde_json::to_vec(request) {
            Ok(body) => body,
            Err(err) => return Completion::ready(Err(err.into())),
        };
        let raw = self.call_async(service_id, method_id, body);
        let promise = Promise::with_abandon_error(SessionError::abandoned);
        let completion = promise.completion();
        raw.on_complete(move |result| {
            let decoded = match result {
                Ok(bytes) => serde_json::from_slice(bytes).map_err(SessionError::from),
                Err(err) => Err(err.clone()),
            };
            promise.try_complete(decoded);
        });
        completion
    }

    pub fn call_json_sync<Req, Resp>(
        &self,
        service_id: u16,
        method_id: u16,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let answer = self.call_sync(service_id, method_id, body)?;
        Ok(serde_json::from_slice(&answer)?)
    }

    /// Fire-and-forget message. No answer is produced.
    pub fn send_one_way(
        &self,
        service_id: u16,
        method_id: u16,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        let local_id = self.local_id;
        let message = OneWay {
            service_id,
            method_id,
            body: body.into(),
        };
        self.event_loop
            .submit(move |manager: &mut SessionManager| manager.send_one_way(local_id, message))
            .map_err(SessionError::from)
    }

    /// Close the session through its outbound pipeline.
    pub fn close(&self) -> Result<()> {
        let local_id = self.local_id;
        self.event_loop
            .submit(move |manager: &mut SessionManager| manager.request_close(local_id))
            .map_err(SessionError::from)
    }

    /// Install `handler` nearest the wire.
    pub fn add_first(
        &self,
        name: impl Into<String>,
        handler: impl Handler,
    ) -> Completion<(), SessionError> {
        self.add_handler(name.into(), Box::new(handler), true)
    }

    /// Install `handler` nearest the application.
    pub fn add_last(
        &self,
        name: impl Into<String>,
        handler: impl Handler,
    ) -> Completion<(), SessionError> {
        self.add_handler(name.into(), Box::new(handler), false)
    }

    fn add_handler(
        &self,
        name: String,
        handler: Box<dyn Handler>,
        first: bool,
    ) -> Completion<(), SessionError> {
        let promise = Promise::with_abandon_error(SessionError::abandoned);
        let completion = promise.completion();
        let local_id = self.local_id;
        match self.event_loop.submit(move |manager: &mut SessionManager| {
            promise.try_complete(manager.add_handler(local_id, name, handler, first));
        }) {
            Ok(()) => completion,
            Err(err) => Completion::ready(Err(err.into())),
        }
    }

    fn issue(
        &self,
        service_id: u16,
        method_id: u16,
        body: Bytes,
        sync: bool,
        timeout: Duration,
    ) -> Completion<Bytes, SessionError> {
        let promise = Promise::with_abandon_error(SessionError::abandoned);
        let completion = promise.completion();
        let local_id = self.local_id;
        let call = OutgoingCall {
            service_id,
            method_id,
            body,
            sync,
            timeout,
        };
        match self
            .event_loop
            .submit(move |manager: &mut SessionManager| manager.call(local_id, call, promise))
        {
            Ok(()) => completion,
            Err(err) => Completion::ready(Err(err.into())),
        }
    }
}
