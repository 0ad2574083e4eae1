//! Per-loop session bookkeeping.
//!
//! A [`SessionManager`] is the context value of one event loop. Everything a
//! session owns (links, pipeline, sequence state, pending calls) lives here
//! and is only touched on that loop's thread. Reader threads and handles
//! reach it by submitting tasks.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gamewire_frame::{
    Body, BodyError, ConnectRequest, ConnectResponse, Message, OneWay, ResultCode, RpcRequest,
    RpcResponse, SequencedMessage,
};
use gamewire_loop::{EventLoop, LoopHooks, Promise};
use gamewire_transport::WireStream;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::handshake::{mint_session_id, validate_request, HandshakeValidator, MAX_SESSION_ID_LEN};
use crate::listener::SessionListener;
use crate::pipeline::{Effect, Handler, Pipeline};
use crate::rpc::RpcCoordinator;
use crate::runtime::{spawn_reader, SessionHandle};
use crate::sequence::{Receipt, SequenceState};
use crate::service::{CallContext, Responder, ServiceRegistry};
use crate::session::{Link, Role, Session, SessionInfo, SessionSnapshot, SessionState};

/// Installs handlers on every new session before it is announced.
pub type PipelineInitializer =
    Arc<dyn Fn(&SessionInfo, &mut Pipeline) -> Result<()> + Send + Sync>;

/// Runtime-wide state shared by every loop.
pub(crate) struct Shared {
    pub(crate) config: SessionConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) validator: Arc<dyn HandshakeValidator>,
    pub(crate) listeners: Vec<Arc<dyn SessionListener>>,
    pub(crate) initializer: Option<PipelineInitializer>,
    next_link: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        config: SessionConfig,
        registry: ServiceRegistry,
        validator: Arc<dyn HandshakeValidator>,
        listeners: Vec<Arc<dyn SessionListener>>,
        initializer: Option<PipelineInitializer>,
    ) -> Self {
        Self {
            config,
            registry,
            validator,
            listeners,
            initializer,
            next_link: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }
}

/// An RPC about to be issued on a session.
pub(crate) struct OutgoingCall {
    pub(crate) service_id: u16,
    pub(crate) method_id: u16,
    pub(crate) body: Bytes,
    pub(crate) sync: bool,
    pub(crate) timeout: Duration,
}

/// The context value of one session event loop.
pub struct SessionManager {
    index: usize,
    event_loop: EventLoop<SessionManager>,
    shared: Arc<Shared>,
    sessions: HashMap<u64, Session>,
    /// Live link id → owning session.
    links: HashMap<u64, u64>,
    by_session_id: HashMap<String, u64>,
    last_local_id: u64,
    rpc: RpcCoordinator,
    closing: bool,
}

impl LoopHooks for SessionManager {
    fn on_start(&mut self) {
        let heartbeat = self.shared.config.heartbeat_interval();
        if let Err(err) = self.event_loop.schedule_fixed_delay(
            heartbeat,
            heartbeat,
            |manager: &mut SessionManager| manager.heartbeat(),
        ) {
            tracing::warn!(loop_index = self.index, error = %err, "heartbeat timer not scheduled");
        }
        let period = self.watchdog_period();
        if let Err(err) = self.event_loop.schedule_fixed_delay(
            period,
            period,
            |manager: &mut SessionManager| manager.watchdog(),
        ) {
            tracing::warn!(loop_index = self.index, error = %err, "watchdog timer not scheduled");
        }
        tracing::debug!(
            loop_index = self.index,
            ?heartbeat,
            watchdog = ?period,
            "session loop started"
        );
    }

    fn loop_once(&mut self) {
        self.flush_all();
    }

    fn clean_up(&mut self) {
        self.closing = true;
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id, SessionError::SessionClosed("runtime shut down".to_string()));
        }
        let failed = self
            .rpc
            .fail_all(&SessionError::SessionClosed("runtime shut down".to_string()));
        tracing::debug!(loop_index = self.index, failed_calls = failed, "session loop cleaned up");
    }
}

impl SessionManager {
    pub(crate) fn new(
        index: usize,
        event_loop: &EventLoop<SessionManager>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            index,
            event_loop: event_loop.clone(),
            shared,
            sessions: HashMap::new(),
            links: HashMap::new(),
            by_session_id: HashMap::new(),
            last_local_id: 0,
            rpc: RpcCoordinator::new(),
            closing: false,
        }
    }

    fn allocate_local_id(&mut self) -> u64 {
        self.last_local_id += 1;
        self.last_local_id
    }

    fn new_sequence(&self) -> SequenceState {
        let config = &self.shared.config;
        SequenceState::new(config.ordered_delivery, config.max_unacked_messages)
    }

    fn watchdog_period(&self) -> Duration {
        let config = &self.shared.config;
        (config.session_timeout().min(config.handshake_timeout()) / 4)
            .clamp(Duration::from_millis(5), Duration::from_secs(1))
    }

    fn handle(&self, local_id: u64) -> Option<SessionHandle> {
        let session = self.sessions.get(&local_id)?;
        Some(SessionHandle::new(
            self.event_loop.clone(),
            &session.info,
            &self.shared.config,
        ))
    }

    fn start_reader(&self, link_id: u64, reader: WireStream) -> Result<()> {
        spawn_reader(
            self.event_loop.clone(),
            link_id,
            reader,
            self.shared.config.frame_config(),
        )
    }

    /// Open a brand new session over `link` and send the first
    /// `CONNECT_REQUEST`.
    pub(crate) fn begin_connect(
        &mut self,
        link: Link,
        reader: WireStream,
        identity: String,
        token: Bytes,
        promise: Promise<SessionHandle, SessionError>,
    ) {
        if self.closing {
            link.close();
            promise.try_failure(SessionError::SessionClosed(
                "runtime is shutting down".to_string(),
            ));
            return;
        }
        let link_id = link.id;
        let local_id = self.allocate_local_id();
        let info = SessionInfo {
            local_id,
            session_id: String::new(),
            identity,
            role: Role::Initiator,
            peer: link.peer().to_string(),
        };
        let mut session = Session::new(info, self.new_sequence(), link);
        session.token = token;
        session.connect = Some(promise);
        self.links.insert(link_id, local_id);
        self.sessions.insert(local_id, session);

        if let Err(err) = self.start_reader(link_id, reader) {
            self.close_session(local_id, err);
            return;
        }
        if let Err(err) = self.send_connect_request(local_id) {
            self.close_session(local_id, err);
        }
    }

    /// Resume an established initiator session over a fresh link.
    pub(crate) fn begin_reconnect(
        &mut self,
        local_id: u64,
        link: Link,
        reader: WireStream,
        promise: Promise<SessionHandle, SessionError>,
    ) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            link.close();
            promise.try_failure(SessionError::SessionClosed("session is gone".to_string()));
            return;
        };
        if session.info.role != Role::Initiator || session.info.session_id.is_empty() {
            link.close();
            promise.try_failure(SessionError::InvalidConfig(
                "only an established initiator session can be resumed".to_string(),
            ));
            return;
        }
        if let Some(superseded) = session.connect.take() {
            superseded.try_failure(SessionError::HandshakeMismatch(
                "superseded by a newer attempt".to_string(),
            ));
        }

        let link_id = link.id;
        if let Some(previous) = session.replace_link(link) {
            self.links.remove(&previous.id);
            if let Some(stale) = session.retired.replace(previous) {
                stale.close();
            }
        }
        session.attempt += 1;
        session.state = SessionState::Connecting;
        session.connecting_since = Instant::now();
        session.connect = Some(promise);
        tracing::info!(session = %session.info, attempt = session.attempt, "resuming session");
        self.links.insert(link_id, local_id);

        if let Err(err) = self.start_reader(link_id, reader) {
            self.close_session(local_id, err);
            return;
        }
        if let Err(err) = self.send_connect_request(local_id) {
            self.close_session(local_id, err);
        }
    }

    fn send_connect_request(&mut self, local_id: u64) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return Ok(());
        };
        let request = ConnectRequest {
            identity: session.info.identity.clone(),
            session_id: session.info.session_id.clone(),
            attempt: session.attempt,
            sequence: session.sequence.next_sequence(),
            ack: session.sequence.received(),
            token: session.token.clone(),
        };
        tracing::debug!(
            session = %session.info,
            attempt = request.attempt,
            sequence = request.sequence,
            ack = request.ack,
            "sending connect request"
        );
        let message = Message::ConnectRequest(request);
        session.feed(&message)?;
        session.flush()
    }

    fn on_connect_response(&mut self, local_id: u64, response: ConnectResponse) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        if session.info.role != Role::Initiator {
            self.close_session(
                local_id,
                SessionError::Protocol("connect response sent to a responder".to_string()),
            );
            return;
        }
        if session.state != SessionState::Connecting || response.attempt != session.attempt {
            let mismatch = SessionError::HandshakeMismatch(format!(
                "response for attempt {} while {} at attempt {}",
                response.attempt,
                session.state.name(),
                session.attempt
            ));
            tracing::debug!(
                session = %session.info,
                error = %mismatch,
                "discarding stale connect response"
            );
            return;
        }
        if !response.success {
            let reason = if response.reason.is_empty() {
                "rejected by responder".to_string()
            } else {
                response.reason
            };
            self.close_session(local_id, SessionError::HandshakeFailed(reason));
            return;
        }
        if response.session_id.is_empty() || response.session_id.len() > MAX_SESSION_ID_LEN {
            self.close_session(
                local_id,
                SessionError::Protocol("connect response carries no usable session id".to_string()),
            );
            return;
        }
        if !session.info.session_id.is_empty() && session.info.session_id != response.session_id {
            let err = SessionError::Protocol(format!(
                "session {} resumed as {}",
                session.info.session_id, response.session_id
            ));
            self.close_session(local_id, err);
            return;
        }

        let resumed = session.was_active;
        if !resumed {
            session.sequence.start_receiving_at(response.sequence);
        }
        if let Err(err) = session.sequence.on_ack(response.ack) {
            self.close_session(local_id, err);
            return;
        }
        session.info.session_id = response.session_id;
        session.state = SessionState::Active;
        session.last_read = Instant::now();
        if let Some(previous) = session.retired.take() {
            previous.close();
        }

        let mut replay = session.sequence.retransmit();
        replay.append(&mut session.held);
        let replayed = replay.len();
        let mut outcome = Ok(());
        for message in replay {
            outcome = session.feed(&Message::Sequenced(message));
            if outcome.is_err() {
                break;
            }
        }
        if let Err(err) = outcome {
            self.close_session(local_id, err);
            return;
        }

        self.by_session_id
            .insert(session.info.session_id.clone(), local_id);
        let promise = session.connect.take();
        if resumed {
            tracing::info!(
                session = %session.info,
                attempt = session.attempt,
                replayed,
                "session resumed"
            );
        } else {
            tracing::info!(
                session = %session.info,
                peer = %session.info.peer,
                "session established"
            );
            self.activate(local_id);
        }
        if let (Some(promise), Some(handle)) = (promise, self.handle(local_id)) {
            promise.try_success(handle);
        }
    }

    /// Answer a `CONNECT_REQUEST` read off a new link.
    pub(crate) fn accept(&mut self, link: Link, request: ConnectRequest) {
        let attempt = request.attempt;
        if self.closing {
            reject(link, attempt, "runtime is shutting down");
            return;
        }
        if let Err(err) = validate_request(&request) {
            reject(link, attempt, &err.to_string());
            return;
        }
        if let Err(reason) = self.shared.validator.accept(&request) {
            reject(link, attempt, &reason);
            return;
        }
        if request.session_id.is_empty() {
            self.accept_fresh(link, request);
        } else {
            self.accept_resume(link, request);
        }
    }

    fn accept_fresh(&mut self, link: Link, request: ConnectRequest) {
        let link_id = link.id;
        let local_id = self.allocate_local_id();
        let session_id = mint_session_id(self.index);
        let info = SessionInfo {
            local_id,
            session_id: session_id.clone(),
            identity: request.identity,
            role: Role::Responder,
            peer: link.peer().to_string(),
        };
        let mut session = Session::new(info, self.new_sequence(), link);
        session.sequence.start_receiving_at(request.sequence);
        session.attempt = request.attempt;
        session.state = SessionState::Active;

        let response = ConnectResponse::accepted(
            request.attempt,
            session.sequence.next_sequence(),
            session.sequence.received(),
            session_id.clone(),
        );
        if let Err(err) = session
            .feed(&Message::ConnectResponse(response))
            .and_then(|()| session.flush())
        {
            tracing::warn!(
                session = %session.info,
                error = %err,
                "could not answer connect request"
            );
            session.close_links();
            return;
        }

        tracing::info!(session = %session.info, peer = %session.info.peer, "session accepted");
        self.links.insert(link_id, local_id);
        self.by_session_id.insert(session_id, local_id);
        self.sessions.insert(local_id, session);
        self.activate(local_id);
    }

    fn accept_resume(&mut self, link: Link, request: ConnectRequest) {
        let attempt = request.attempt;
        let found = self
            .by_session_id
            .get(&request.session_id)
            .copied()
            .filter(|id| {
                self.sessions.get(id).is_some_and(|session| {
                    session.info.role == Role::Responder
                        && session.state == SessionState::Active
                        && session.info.identity == request.identity
                })
            });
        let Some(local_id) = found else {
            reject(link, attempt, "unknown session");
            return;
        };
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        if let Err(err) = session.sequence.on_ack(request.ack) {
            reject(link, attempt, &err.to_string());
            return;
        }

        let link_id = link.id;
        if let Some(previous) = session.replace_link(link) {
            self.links.remove(&previous.id);
            previous.close();
        }
        self.links.insert(link_id, local_id);
        session.attempt = attempt;
        session.last_read = Instant::now();

        let response = ConnectResponse::accepted(
            attempt,
            session.sequence.next_sequence(),
            session.sequence.received(),
            session.info.session_id.clone(),
        );
        let replay = session.sequence.retransmit();
        let replayed = replay.len();
        let mut outcome = session.feed(&Message::ConnectResponse(response));
        for message in replay {
            if outcome.is_err() {
                break;
            }
            outcome = session.feed(&Message::Sequenced(message));
        }
        let outcome = outcome.and_then(|()| session.flush());
        tracing::info!(session = %session.info, attempt, replayed, "session resumed by peer");
        if let Err(err) = outcome {
            self.close_session(local_id, err);
        }
    }

    pub(crate) fn on_message(&mut self, link_id: u64, message: Message) {
        let Some(&local_id) = self.links.get(&link_id) else {
            tracing::trace!(link = link_id, kind = %message.kind(), "message on a retired link");
            return;
        };
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        session.last_read = Instant::now();
        match message {
            Message::ConnectResponse(response) => self.on_connect_response(local_id, response),
            Message::ConnectRequest(_) => self.close_session(
                local_id,
                SessionError::Protocol("connect request on an established link".to_string()),
            ),
            Message::Ping { ack } => {
                let outcome = session.sequence.on_ack(ack).and_then(|_| {
                    let pong = Message::Pong {
                        ack: session.sequence.received(),
                    };
                    session.feed(&pong)
                });
                if let Err(err) = outcome {
                    self.close_session(local_id, err);
                }
            }
            Message::Pong { ack } => {
                if let Err(err) = session.sequence.on_ack(ack) {
                    self.close_session(local_id, err);
                }
            }
            Message::Sequenced(message) => self.on_sequenced(local_id, message),
        }
    }

    fn on_sequenced(&mut self, local_id: u64, message: SequencedMessage) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        if session.state != SessionState::Active {
            tracing::debug!(
                session = %session.info,
                sequence = message.sequence,
                "dropping traffic received before the handshake completed"
            );
            return;
        }
        let receipt = session
            .sequence
            .on_ack(message.ack)
            .and_then(|_| session.sequence.on_receive(message.sequence));
        match receipt {
            Ok(Receipt::Deliver) => {}
            Ok(Receipt::Duplicate) => {
                tracing::trace!(
                    session = %session.info,
                    sequence = message.sequence,
                    "dropping duplicate"
                );
                return;
            }
            Err(err) => {
                self.close_session(local_id, err);
                return;
            }
        }
        let effects = session.pipeline.fire_read(&session.info, message.body);
        self.apply(local_id, effects);
    }

    /// A frame arrived intact but its payload did not parse.
    pub(crate) fn on_body_error(
        &mut self,
        link_id: u64,
        error: BodyError,
        head: Option<(u64, u64)>,
    ) {
        let Some(&local_id) = self.links.get(&link_id) else {
            return;
        };
        if error.is_fatal() {
            self.close_session(local_id, SessionError::from(error));
            return;
        }
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        session.last_read = Instant::now();
        tracing::warn!(
            session = %session.info,
            kind = %error.kind,
            error = %error,
            "dropping undecodable message"
        );
        // The message still consumed its sequence number.
        if let (Some((sequence, ack)), SessionState::Active) = (head, session.state) {
            let outcome = session
                .sequence
                .on_ack(ack)
                .and_then(|_| session.sequence.on_receive(sequence));
            if let Err(err) = outcome {
                self.close_session(local_id, err);
            }
        }
    }

    /// The reader thread of `link_id` stopped.
    pub(crate) fn on_link_failed(&mut self, link_id: u64, error: SessionError) {
        match self.links.get(&link_id) {
            Some(&local_id) => self.close_session(local_id, error),
            None => tracing::trace!(link = link_id, error = %error, "retired link ended"),
        }
    }

    pub(crate) fn call(
        &mut self,
        local_id: u64,
        call: OutgoingCall,
        promise: Promise<Bytes, SessionError>,
    ) {
        if !self.sessions.contains_key(&local_id) {
            promise.try_failure(SessionError::SessionClosed("session is gone".to_string()));
            return;
        }
        let request_id = self.rpc.next_request_id();
        self.rpc.register(request_id, local_id, promise, call.timeout);
        match self
            .event_loop
            .schedule_once(call.timeout, move |manager: &mut SessionManager| {
                manager.rpc.expire(request_id);
            }) {
            Ok(timer) => self.rpc.set_timer(request_id, timer),
            Err(err) => {
                self.rpc.fail(request_id, SessionError::from(err));
                return;
            }
        }
        let request = RpcRequest {
            request_id,
            sync: call.sync,
            service_id: call.service_id,
            method_id: call.method_id,
            body: call.body,
        };
        self.write(local_id, Body::Request(request));
    }

    pub(crate) fn send_one_way(&mut self, local_id: u64, message: OneWay) {
        self.write(local_id, Body::OneWay(message));
    }

    /// Send a handler's answer. Called via [`Responder`].
    pub(crate) fn respond(&mut self, local_id: u64, response: RpcResponse) {
        if !self.sessions.contains_key(&local_id) {
            tracing::debug!(
                session = local_id,
                request_id = response.request_id,
                "session closed before the response was sent"
            );
            return;
        }
        self.write(local_id, Body::Response(response));
    }

    /// Run a close through the outbound pipeline.
    pub(crate) fn request_close(&mut self, local_id: u64) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        let effects = session.pipeline.close(&session.info);
        self.apply(local_id, effects);
    }

    pub(crate) fn add_handler(
        &mut self,
        local_id: u64,
        name: String,
        handler: Box<dyn Handler>,
        first: bool,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&local_id)
            .ok_or_else(|| SessionError::SessionClosed("session is gone".to_string()))?;
        if first {
            session.pipeline.add_first(name, handler)
        } else {
            session.pipeline.add_last(name, handler)
        }
    }

    /// Answer new requests with `ShuttingDown` from now on.
    pub(crate) fn begin_shutdown(&mut self) {
        self.closing = true;
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .map(|session| SessionSnapshot {
                info: session.info.clone(),
                state: session.state,
                attempt: session.attempt,
                next_sequence: if session.sequence.is_enabled() {
                    session.sequence.next_sequence()
                } else {
                    0
                },
                received: session.sequence.received(),
                peer_acked: session.sequence.peer_acked(),
                unacked: session.sequence.unacked_len(),
                pending_calls: self.rpc.pending_for(session.info.local_id),
                handlers: session
                    .pipeline
                    .names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            })
            .collect();
        sessions.sort_by_key(|snapshot| snapshot.info.local_id);
        sessions
    }

    /// Send `body` down the session's outbound pipeline.
    fn write(&mut self, local_id: u64, body: Body) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            if let Body::Request(request) = &body {
                self.rpc.fail(
                    request.request_id,
                    SessionError::SessionClosed("session is gone".to_string()),
                );
            }
            return;
        };
        let effects = session.pipeline.write(&session.info, body);
        self.apply(local_id, effects);
    }

    fn apply(&mut self, local_id: u64, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Deliver(body) => self.deliver(local_id, body),
                Effect::Transmit(body) => self.transmit(local_id, body),
                Effect::Flush => {
                    if let Some(session) = self.sessions.get_mut(&local_id) {
                        if let Err(err) = session.flush() {
                            self.close_session(local_id, err);
                        }
                    }
                }
                Effect::Close => self.close_session(
                    local_id,
                    SessionError::SessionClosed("closed locally".to_string()),
                ),
            }
        }
    }

    /// Put a body that has left the pipeline on the wire.
    fn transmit(&mut self, local_id: u64, body: Body) {
        let max = self.shared.config.max_frame_size;
        let size = body.frame_len();
        if size > max {
            let err = SessionError::Frame(format!(
                "{} of {size} bytes exceeds the {max} byte frame limit",
                body.kind()
            ));
            tracing::warn!(session = local_id, error = %err, "refusing oversized message");
            match body {
                Body::Request(request) => {
                    self.rpc.fail(request.request_id, err);
                }
                Body::Response(response) => self.transmit(
                    local_id,
                    Body::Response(RpcResponse::error(
                        response.request_id,
                        ResultCode::HandlerFailed,
                        "response exceeds the frame limit",
                    )),
                ),
                Body::OneWay(_) => {}
            }
            return;
        }

        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        let message = match session.sequence.stamp(body) {
            Ok(message) => message,
            Err(err) => {
                self.close_session(local_id, err);
                return;
            }
        };
        if session.state != SessionState::Active {
            // Ordered traffic waits in the retransmission buffer.
            if !session.sequence.is_enabled() {
                session.held.push(message);
            }
            return;
        }
        if let Err(err) = session.feed(&Message::Sequenced(message)) {
            self.close_session(local_id, err);
        }
    }

    /// Hand a body that left the inbound pipeline to the RPC layer.
    fn deliver(&mut self, local_id: u64, body: Body) {
        match body {
            Body::Response(response) => {
                let request_id = response.request_id;
                if self.rpc.complete(local_id, response).is_none() {
                    tracing::debug!(
                        session = local_id,
                        request_id,
                        "response for no pending call; dropped"
                    );
                }
            }
            Body::Request(request) => self.dispatch(
                local_id,
                request.service_id,
                request.method_id,
                Some(request.request_id),
                request.sync,
                request.body,
            ),
            Body::OneWay(message) => self.dispatch(
                local_id,
                message.service_id,
                message.method_id,
                None,
                false,
                message.body,
            ),
        }
    }

    fn dispatch(
        &mut self,
        local_id: u64,
        service_id: u16,
        method_id: u16,
        request_id: Option<u64>,
        sync: bool,
        body: Bytes,
    ) {
        let Some(session) = self.sessions.get(&local_id) else {
            return;
        };
        let handler = if self.closing {
            Err((ResultCode::ShuttingDown, "runtime is shutting down".to_string()))
        } else {
            self.shared
                .registry
                .lookup(service_id, method_id)
                .ok_or_else(|| {
                    (
                        ResultCode::NoSuchMethod,
                        format!("no method {service_id}:{method_id}"),
                    )
                })
        };
        let handler = match handler {
            Ok(handler) => handler,
            Err((code, text)) => {
                tracing::debug!(
                    session = %session.info,
                    service_id,
                    method_id,
                    %code,
                    "refusing call"
                );
                if let Some(request_id) = request_id {
                    let response = RpcResponse::error(request_id, code, text);
                    self.write(local_id, Body::Response(response));
                }
                return;
            }
        };

        let ctx = CallContext {
            session: session.info.clone(),
            service_id,
            method_id,
            request_id,
            sync,
        };
        let responder = match request_id {
            Some(request_id) => Responder::new(self.event_loop.clone(), local_id, request_id),
            None => Responder::one_way(),
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, body, responder))).is_err() {
            tracing::error!(
                session = %ctx.session,
                service_id,
                method_id,
                "method handler panicked"
            );
        }
    }

    /// First transition to `Active`: install handlers and announce.
    fn activate(&mut self, local_id: u64) {
        let Some(session) = self.sessions.get_mut(&local_id) else {
            return;
        };
        session.was_active = true;
        if let Some(initializer) = &self.shared.initializer {
            if let Err(err) = initializer(&session.info, &mut session.pipeline) {
                tracing::warn!(
                    session = %session.info,
                    error = %err,
                    "pipeline initializer failed"
                );
            }
        }
        let effects = session.pipeline.fire_session_active(&session.info);
        let info = session.info.clone();
        for listener in &self.shared.listeners {
            notify(&info, || listener.on_active(&info));
        }
        self.apply(local_id, effects);
    }

    /// Tear a session down. Idempotent: the session leaves every table
    /// first, so listeners hear about it once.
    fn close_session(&mut self, local_id: u64, reason: SessionError) {
        let Some(mut session) = self.sessions.remove(&local_id) else {
            return;
        };
        let link_ids: Vec<u64> = session.link_ids().collect();
        for link_id in link_ids {
            self.links.remove(&link_id);
        }
        if self.by_session_id.get(&session.info.session_id) == Some(&local_id) {
            self.by_session_id.remove(&session.info.session_id);
        }
        if let Err(err) = session.flush() {
            tracing::trace!(session = %session.info, error = %err, "final flush failed");
        }
        session.close_links();
        session.state = SessionState::Inactive;

        if let Some(promise) = session.connect.take() {
            promise.try_failure(reason.clone());
        }
        let failed = self.rpc.fail_session(
            local_id,
            &SessionError::SessionClosed(reason.to_string()),
        );

        if !session.was_active {
            tracing::debug!(session = %session.info, reason = %reason, "connection attempt closed");
            return;
        }
        tracing::info!(
            session = %session.info,
            reason = %reason,
            failed_calls = failed,
            "session inactive"
        );
        let effects = session.pipeline.fire_session_inactive(&session.info);
        if !effects.is_empty() {
            tracing::debug!(
                session = %session.info,
                dropped = effects.len(),
                "effects after close dropped"
            );
        }
        for listener in &self.shared.listeners {
            notify(&session.info, || listener.on_inactive(&session.info, &reason));
        }
    }

    /// Ack backlog threshold above which a standalone `PONG` goes out.
    fn ack_threshold(&self) -> u64 {
        (self.shared.config.max_unacked_messages / 4).max(1) as u64
    }

    fn flush_all(&mut self) {
        let threshold = self.ack_threshold();
        let mut failed = Vec::new();
        for (&local_id, session) in &mut self.sessions {
            if session.state == SessionState::Active
                && session.sequence.ack_backlog() >= threshold
            {
                let pong = Message::Pong {
                    ack: session.sequence.received(),
                };
                if let Err(err) = session.feed(&pong) {
                    failed.push((local_id, err));
                    continue;
                }
            }
            if let Err(err) = session.flush() {
                failed.push((local_id, err));
            }
        }
        for (local_id, err) in failed {
            self.close_session(local_id, err);
        }
    }

    fn heartbeat(&mut self) {
        let interval = self.shared.config.heartbeat_interval();
        let mut failed = Vec::new();
        for (&local_id, session) in &mut self.sessions {
            // A peer that only receives never writes on its own, so a quiet
            // read side needs a ping as much as a quiet write side.
            let idle = session.info.role == Role::Initiator
                && session.state == SessionState::Active
                && (session.last_write.elapsed() >= interval
                    || session.last_read.elapsed() >= interval);
            if !idle {
                continue;
            }
            let ping = Message::Ping {
                ack: session.sequence.received(),
            };
            if let Err(err) = session.feed(&ping) {
                failed.push((local_id, err));
            }
        }
        for (local_id, err) in failed {
            self.close_session(local_id, err);
        }
    }

    fn watchdog(&mut self) {
        let now = Instant::now();
        let session_timeout = self.shared.config.session_timeout();
        let handshake_timeout = self.shared.config.handshake_timeout();
        let expired: Vec<(u64, Duration)> = self
            .sessions
            .iter()
            .filter_map(|(&local_id, session)| match session.state {
                SessionState::Active
                    if now.saturating_duration_since(session.last_read) > session_timeout =>
                {
                    Some((local_id, session_timeout))
                }
                SessionState::Connecting
                    if now.saturating_duration_since(session.connecting_since)
                        > handshake_timeout =>
                {
                    Some((local_id, handshake_timeout))
                }
                _ => None,
            })
            .collect();
        for (local_id, limit) in expired {
            tracing::warn!(session = local_id, ?limit, "session timed out");
            self.close_session(local_id, SessionError::Timeout(limit));
        }
    }
}

/// Answer a refused handshake and drop the link.
fn reject(mut link: Link, attempt: u32, reason: &str) {
    tracing::info!(peer = %link.peer(), attempt, reason, "rejecting connect request");
    let response = Message::ConnectResponse(ConnectResponse::rejected(attempt, reason));
    if let Err(err) = link.send(&response) {
        tracing::debug!(peer = %link.peer(), error = %err, "could not deliver rejection");
    }
    link.close();
}

/// Run a listener callback, containing any panic.
fn notify(session: &SessionInfo, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!(session = %session, "session listener panicked");
    }
}
