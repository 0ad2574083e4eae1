//! Per-session handler chain.
//!
//! Handlers sit in a doubly linked list between a head and a tail sentinel.
//! Inbound events (`session_active`, `read`, `session_inactive`,
//! `exception_caught`) walk head → tail; outbound events (`write`, `flush`,
//! `close`) walk tail → head. Each handler declares a [`Capability`] and is
//! only visited by events of the matching direction.
//!
//! A handler that fails does not unwind the walk: its error is handed to
//! `exception_caught` of the next inbound handler after it, and an error
//! nobody handles is logged at the tail. Writes a handler issues through its
//! [`HandlerContext`] are queued and walked from that handler toward the
//! head once the current walk has finished, so handlers are never
//! re-entered.
//!
//! A pipeline belongs to one session and is only touched on the session's
//! event loop; it uses no locking.

use std::collections::VecDeque;
use std::fmt;

use gamewire_frame::Body;

use crate::error::{Result, SessionError};
use crate::session::SessionInfo;

const HEAD: usize = 0;
const TAIL: usize = 1;

/// Upper bound on handler-issued operations processed per event.
const MAX_DEFERRED: usize = 4096;

/// Which event directions a handler takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Inbound,
    Outbound,
    Both,
}

impl Capability {
    pub fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Both)
    }

    pub fn is_outbound(self) -> bool {
        matches!(self, Self::Outbound | Self::Both)
    }
}

/// A failure raised by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    origin: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the handler that raised the error.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn raised_by(mut self, name: &str) -> Self {
        if self.origin.is_none() {
            self.origin = Some(name.to_string());
        }
        self
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Whether a lifecycle event continues to the next handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

impl Flow {
    fn then<E>(self, event: E) -> Option<E> {
        match self {
            Self::Continue => Some(event),
            Self::Stop => None,
        }
    }
}

/// A pipeline stage.
///
/// Every method has a pass-through default, so a handler only overrides the
/// events it cares about. Returning `Ok(None)` (or `Flow::Stop`) consumes
/// the event.
pub trait Handler: Send + 'static {
    fn capability(&self) -> Capability;

    fn session_active(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
        Ok(Flow::Continue)
    }

    fn read(&mut self, _ctx: &mut HandlerContext<'_>, body: Body) -> HandlerResult<Option<Body>> {
        Ok(Some(body))
    }

    fn session_inactive(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
        Ok(Flow::Continue)
    }

    /// Return `None` once the error is handled.
    fn exception_caught(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        error: HandlerError,
    ) -> Option<HandlerError> {
        Some(error)
    }

    fn write(&mut self, _ctx: &mut HandlerContext<'_>, body: Body) -> HandlerResult<Option<Body>> {
        Ok(Some(body))
    }

    fn flush(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
        Ok(Flow::Continue)
    }

    fn close(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
        Ok(Flow::Continue)
    }
}

/// What came out of either end of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// An inbound body passed every handler; dispatch it.
    Deliver(Body),
    /// An outbound body passed every handler; put it on the wire.
    Transmit(Body),
    Flush,
    Close,
}

enum InEvent {
    Active,
    Read(Body),
    Inactive,
    Exception(HandlerError),
}

enum OutEvent {
    Write(Body),
    Flush,
    Close,
}

/// A handler's view of its session and position.
pub struct HandlerContext<'a> {
    session: &'a SessionInfo,
    name: &'a str,
    node: usize,
    deferred: &'a mut VecDeque<(usize, OutEvent)>,
}

impl HandlerContext<'_> {
    pub fn session(&self) -> &SessionInfo {
        self.session
    }

    /// This handler's name in the pipeline.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Write `body` starting at the handler before this one.
    pub fn write(&mut self, body: Body) {
        self.deferred.push_back((self.node, OutEvent::Write(body)));
    }

    pub fn flush(&mut self) {
        self.deferred.push_back((self.node, OutEvent::Flush));
    }

    /// Close the session once the current event has been processed.
    pub fn close(&mut self) {
        self.deferred.push_back((self.node, OutEvent::Close));
    }
}

struct Node {
    name: String,
    capability: Capability,
    handler: Option<Box<dyn Handler>>,
    prev: usize,
    next: usize,
}

impl Node {
    fn sentinel(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: Capability::Both,
            handler: None,
            prev: HEAD,
            next: TAIL,
        }
    }
}

/// The handler chain of one session.
pub struct Pipeline {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::sentinel("head"), Node::sentinel("tail")],
            free: Vec::new(),
        }
    }

    /// Insert a handler right after the head.
    pub fn add_first(&mut self, name: impl Into<String>, handler: Box<dyn Handler>) -> Result<()> {
        self.insert_after(HEAD, name.into(), handler)
    }

    /// Insert a handler right before the tail.
    pub fn add_last(&mut self, name: impl Into<String>, handler: Box<dyn Handler>) -> Result<()> {
        let last = self.nodes[TAIL].prev;
        self.insert_after(last, name.into(), handler)
    }

    /// Unlink a handler by name.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Handler>> {
        let idx = self.position(name)?;
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        let node = &mut self.nodes[idx];
        node.name.clear();
        self.free.push(idx);
        node.handler.take()
    }

    /// Handler names, head to tail.
    pub fn names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            names.push(self.nodes[idx].name.as_str());
            idx = self.nodes[idx].next;
        }
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 2 - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_session_active(&mut self, session: &SessionInfo) -> Vec<Effect> {
        self.run_inbound(session, InEvent::Active)
    }

    pub fn fire_read(&mut self, session: &SessionInfo, body: Body) -> Vec<Effect> {
        self.run_inbound(session, InEvent::Read(body))
    }

    pub fn fire_session_inactive(&mut self, session: &SessionInfo) -> Vec<Effect> {
        self.run_inbound(session, InEvent::Inactive)
    }

    pub fn fire_exception_caught(
        &mut self,
        session: &SessionInfo,
        error: HandlerError,
    ) -> Vec<Effect> {
        self.run_inbound(session, InEvent::Exception(error))
    }

    pub fn write(&mut self, session: &SessionInfo, body: Body) -> Vec<Effect> {
        self.run_outbound(session, OutEvent::Write(body))
    }

    pub fn flush(&mut self, session: &SessionInfo) -> Vec<Effect> {
        self.run_outbound(session, OutEvent::Flush)
    }

    pub fn close(&mut self, session: &SessionInfo) -> Vec<Effect> {
        self.run_outbound(session, OutEvent::Close)
    }

    fn insert_after(&mut self, prev: usize, name: String, handler: Box<dyn Handler>) -> Result<()> {
        if self.position(&name).is_some() {
            return Err(SessionError::DuplicateHandler(name));
        }
        let next = self.nodes[prev].next;
        let node = Node {
            name,
            capability: handler.capability(),
            handler: Some(handler),
            prev,
            next,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[prev].next = idx;
        self.nodes[next].prev = idx;
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            if self.nodes[idx].name == name {
                return Some(idx);
            }
            idx = self.nodes[idx].next;
        }
        None
    }

    fn run_inbound(&mut self, session: &SessionInfo, event: InEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut deferred = VecDeque::new();
        self.walk_inbound(session, HEAD, event, &mut effects, &mut deferred);
        self.drain_deferred(session, &mut effects, &mut deferred);
        effects
    }

    fn run_outbound(&mut self, session: &SessionInfo, event: OutEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut deferred = VecDeque::new();
        self.walk_outbound(session, TAIL, event, &mut effects, &mut deferred);
        self.drain_deferred(session, &mut effects, &mut deferred);
        effects
    }

    fn drain_deferred(
        &mut self,
        session: &SessionInfo,
        effects: &mut Vec<Effect>,
        deferred: &mut VecDeque<(usize, OutEvent)>,
    ) {
        let mut processed = 0;
        while let Some((origin, event)) = deferred.pop_front() {
            processed += 1;
            if processed > MAX_DEFERRED {
                tracing::warn!(
                    session = %session,
                    dropped = deferred.len() + 1,
                    "handlers issued too many operations for one event; dropping the rest"
                );
                deferred.clear();
                return;
            }
            self.walk_outbound(session, origin, event, effects, deferred);
        }
    }

    /// Walk toward the tail, starting after `from`.
    fn walk_inbound(
        &mut self,
        session: &SessionInfo,
        from: usize,
        mut event: InEvent,
        effects: &mut Vec<Effect>,
        deferred: &mut VecDeque<(usize, OutEvent)>,
    ) {
        let mut idx = self.nodes[from].next;
        while idx != TAIL {
            let node = &mut self.nodes[idx];
            let next = node.next;
            let handler = match node.handler.as_mut() {
                Some(handler) if node.capability.is_inbound() => handler,
                _ => {
                    idx = next;
                    continue;
                }
            };
            let mut ctx = HandlerContext {
                session,
                name: &node.name,
                node: idx,
                deferred: &mut *deferred,
            };
            let outcome = match event {
                InEvent::Active => handler
                    .session_active(&mut ctx)
                    .map(|flow| flow.then(InEvent::Active)),
                InEvent::Read(body) => handler
                    .read(&mut ctx, body)
                    .map(|body| body.map(InEvent::Read)),
                InEvent::Inactive => handler
                    .session_inactive(&mut ctx)
                    .map(|flow| flow.then(InEvent::Inactive)),
                InEvent::Exception(error) => {
                    Ok(handler.exception_caught(&mut ctx, error).map(InEvent::Exception))
                }
            };
            event = match outcome {
                Ok(Some(forward)) => forward,
                Ok(None) => return,
                Err(error) => InEvent::Exception(error.raised_by(&node.name)),
            };
            idx = next;
        }

        match event {
            InEvent::Read(body) => effects.push(Effect::Deliver(body)),
            InEvent::Exception(error) => tracing::warn!(
                session = %session,
                handler = error.origin().unwrap_or("-"),
                error = %error,
                "unhandled handler error reached the end of the pipeline"
            ),
            InEvent::Active | InEvent::Inactive => {}
        }
    }

    /// Walk toward the head, starting before `from`.
    fn walk_outbound(
        &mut self,
        session: &SessionInfo,
        from: usize,
        mut event: OutEvent,
        effects: &mut Vec<Effect>,
        deferred: &mut VecDeque<(usize, OutEvent)>,
    ) {
        let mut idx = self.nodes[from].prev;
        while idx != HEAD {
            let node = &mut self.nodes[idx];
            let prev = node.prev;
            let handler = match node.handler.as_mut() {
                Some(handler) if node.capability.is_outbound() => handler,
                _ => {
                    idx = prev;
                    continue;
                }
            };
            let mut ctx = HandlerContext {
                session,
                name: &node.name,
                node: idx,
                deferred: &mut *deferred,
            };
            let outcome = match event {
                OutEvent::Write(body) => handler
                    .write(&mut ctx, body)
                    .map(|body| body.map(OutEvent::Write)),
                OutEvent::Flush => handler
                    .flush(&mut ctx)
                    .map(|flow| flow.then(OutEvent::Flush)),
                OutEvent::Close => handler
                    .close(&mut ctx)
                    .map(|flow| flow.then(OutEvent::Close)),
            };
            event = match outcome {
                Ok(Some(forward)) => forward,
                Ok(None) => return,
                Err(error) => {
                    let error = error.raised_by(&node.name);
                    self.walk_inbound(session, idx, InEvent::Exception(error), effects, deferred);
                    return;
                }
            };
            idx = prev;
        }

        effects.push(match event {
            OutEvent::Write(body) => Effect::Transmit(body),
            OutEvent::Flush => Effect::Flush,
            OutEvent::Close => Effect::Close,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use gamewire_frame::OneWay;
    use parking_lot::Mutex;

    use super::*;
    use crate::session::Role;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct Behaviour {
        fail_read: bool,
        fail_write: bool,
        consume_read: bool,
        handle_errors: bool,
        echo_on_read: bool,
    }

    struct Probe {
        name: &'static str,
        capability: Capability,
        log: Log,
        behaviour: Behaviour,
    }

    impl Probe {
        fn boxed(name: &'static str, capability: Capability, log: &Log) -> Box<dyn Handler> {
            Self::with(name, capability, log, Behaviour::default())
        }

        fn with(
            name: &'static str,
            capability: Capability,
            log: &Log,
            behaviour: Behaviour,
        ) -> Box<dyn Handler> {
            Box::new(Self {
                name,
                capability,
                log: Arc::clone(log),
                behaviour,
            })
        }

        fn record(&self, event: &str) {
            self.log.lock().push(format!("{}:{event}", self.name));
        }
    }

    impl Handler for Probe {
        fn capability(&self) -> Capability {
            self.capability
        }

        fn session_active(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
            self.record("active");
            Ok(Flow::Continue)
        }

        fn read(
            &mut self,
            ctx: &mut HandlerContext<'_>,
            body: Body,
        ) -> HandlerResult<Option<Body>> {
            self.record("read");
            if self.behaviour.fail_read {
                return Err(HandlerError::new("read failed"));
            }
            if self.behaviour.echo_on_read {
                ctx.write(body.clone());
            }
            if self.behaviour.consume_read {
                return Ok(None);
            }
            Ok(Some(body))
        }

        fn exception_caught(
            &mut self,
            _ctx: &mut HandlerContext<'_>,
            error: HandlerError,
        ) -> Option<HandlerError> {
            self.record(&format!("error({})", error.origin().unwrap_or("-")));
            if self.behaviour.handle_errors {
                None
            } else {
                Some(error)
            }
        }

        fn write(
            &mut self,
            _ctx: &mut HandlerContext<'_>,
            body: Body,
        ) -> HandlerResult<Option<Body>> {
            self.record("write");
            if self.behaviour.fail_write {
                return Err(HandlerError::new("write failed"));
            }
            Ok(Some(body))
        }

        fn close(&mut self, _ctx: &mut HandlerContext<'_>) -> HandlerResult<Flow> {
            self.record("close");
            Ok(Flow::Continue)
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            local_id: 1,
            session_id: "0-1-test".to_string(),
            identity: "scene-1".to_string(),
            role: Role::Responder,
            peer: "unix://<unnamed>".to_string(),
        }
    }

    fn body() -> Body {
        Body::OneWay(OneWay {
            service_id: 1,
            method_id: 1,
            body: Bytes::from_static(b"payload"),
        })
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn taken(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock())
    }

    fn three(log: &Log) -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", Probe::boxed("a", Capability::Both, log)).unwrap();
        pipeline.add_last("b", Probe::boxed("b", Capability::Both, log)).unwrap();
        pipeline.add_last("c", Probe::boxed("c", Capability::Both, log)).unwrap();
        pipeline
    }

    #[test]
    fn inbound_walks_head_to_tail() {
        let log = log();
        let mut pipeline = three(&log);
        let effects = pipeline.fire_read(&info(), body());
        assert_eq!(taken(&log), ["a:read", "b:read", "c:read"]);
        assert_eq!(effects, vec![Effect::Deliver(body())]);

        assert!(pipeline.fire_session_active(&info()).is_empty());
        assert_eq!(taken(&log), ["a:active", "b:active", "c:active"]);
    }

    #[test]
    fn outbound_walks_tail_to_head() {
        let log = log();
        let mut pipeline = three(&log);
        let effects = pipeline.write(&info(), body());
        assert_eq!(taken(&log), ["c:write", "b:write", "a:write"]);
        assert_eq!(effects, vec![Effect::Transmit(body())]);

        assert_eq!(pipeline.close(&info()), vec![Effect::Close]);
        assert_eq!(taken(&log), ["c:close", "b:close", "a:close"]);
        assert_eq!(pipeline.flush(&info()), vec![Effect::Flush]);
    }

    #[test]
    fn capability_decides_who_sees_an_event() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("in", Probe::boxed("in", Capability::Inbound, &log)).unwrap();
        pipeline.add_last("out", Probe::boxed("out", Capability::Outbound, &log)).unwrap();

        pipeline.fire_read(&info(), body());
        assert_eq!(taken(&log), ["in:read"]);
        pipeline.write(&info(), body());
        assert_eq!(taken(&log), ["out:write"]);
    }

    #[test]
    fn failure_resumes_at_the_next_handler() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", Probe::boxed("a", Capability::Both, &log)).unwrap();
        pipeline
            .add_last(
                "b",
                Probe::with(
                    "b",
                    Capability::Both,
                    &log,
                    Behaviour {
                        fail_read: true,
                        ..Behaviour::default()
                    },
                ),
            )
            .unwrap();
        pipeline
            .add_last(
                "c",
                Probe::with(
                    "c",
                    Capability::Inbound,
                    &log,
                    Behaviour {
                        handle_errors: true,
                        ..Behaviour::default()
                    },
                ),
            )
            .unwrap();
        pipeline.add_last("d", Probe::boxed("d", Capability::Both, &log)).unwrap();

        let effects = pipeline.fire_read(&info(), body());
        assert!(effects.is_empty());
        // `a` is not revisited and `d` never hears about the handled error.
        assert_eq!(taken(&log), ["a:read", "b:read", "c:error(b)"]);
    }

    #[test]
    fn unhandled_failure_is_swallowed_at_the_tail() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline
            .add_last(
                "a",
                Probe::with(
                    "a",
                    Capability::Both,
                    &log,
                    Behaviour {
                        fail_read: true,
                        ..Behaviour::default()
                    },
                ),
            )
            .unwrap();
        pipeline.add_last("b", Probe::boxed("b", Capability::Both, &log)).unwrap();

        assert!(pipeline.fire_read(&info(), body()).is_empty());
        assert_eq!(taken(&log), ["a:read", "b:error(a)"]);
    }

    #[test]
    fn outbound_failure_goes_to_exception_caught() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", Probe::boxed("a", Capability::Both, &log)).unwrap();
        pipeline
            .add_last(
                "b",
                Probe::with(
                    "b",
                    Capability::Both,
                    &log,
                    Behaviour {
                        fail_write: true,
                        ..Behaviour::default()
                    },
                ),
            )
            .unwrap();
        pipeline.add_last("c", Probe::boxed("c", Capability::Both, &log)).unwrap();

        assert!(pipeline.write(&info(), body()).is_empty());
        assert_eq!(taken(&log), ["c:write", "b:write", "c:error(b)"]);
    }

    #[test]
    fn handler_writes_start_at_their_position() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", Probe::boxed("a", Capability::Both, &log)).unwrap();
        pipeline
            .add_last(
                "b",
                Probe::with(
                    "b",
                    Capability::Both,
                    &log,
                    Behaviour {
                        echo_on_read: true,
                        consume_read: true,
                        ..Behaviour::default()
                    },
                ),
            )
            .unwrap();
        pipeline.add_last("c", Probe::boxed("c", Capability::Both, &log)).unwrap();

        let effects = pipeline.fire_read(&info(), body());
        assert_eq!(effects, vec![Effect::Transmit(body())]);
        assert_eq!(taken(&log), ["a:read", "b:read", "a:write"]);
    }

    #[test]
    fn add_remove_and_duplicates() {
        let log = log();
        let mut pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        pipeline.add_last("b", Probe::boxed("b", Capability::Both, &log)).unwrap();
        pipeline.add_first("a", Probe::boxed("a", Capability::Both, &log)).unwrap();
        pipeline.add_last("c", Probe::boxed("c", Capability::Both, &log)).unwrap();
        assert_eq!(pipeline.names(), ["a", "b", "c"]);

        let err = pipeline
            .add_last("b", Probe::boxed("b", Capability::Both, &log))
            .unwrap_err();
        assert_eq!(err, SessionError::DuplicateHandler("b".to_string()));

        assert!(pipeline.remove("b").is_some());
        assert!(pipeline.remove("b").is_none());
        assert_eq!(pipeline.names(), ["a", "c"]);
        assert_eq!(pipeline.len(), 2);

        pipeline.add_first("z", Probe::boxed("z", Capability::Both, &log)).unwrap();
        assert_eq!(pipeline.names(), ["z", "a", "c"]);
        pipeline.fire_read(&info(), body());
        assert_eq!(taken(&log), ["z:read", "a:read", "c:read"]);
    }
}
