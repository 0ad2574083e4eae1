//! Request/response correlation for one event loop.
//!
//! Every call in flight has exactly one entry, keyed by request id. The
//! entry leaves the table on the first of response, timeout or session
//! loss, and only the remover completes the promise.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gamewire_frame::RpcResponse;
use gamewire_loop::{Promise, TimerHandle};

use crate::error::SessionError;

/// How a pending call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct PendingCall {
    session: u64,
    promise: Promise<Bytes, SessionError>,
    created_at: Instant,
    deadline: Instant,
    timer: Option<TimerHandle>,
}

impl PendingCall {
    fn finish(self, result: Result<Bytes, SessionError>) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        self.promise.try_complete(result);
    }
}

#[derive(Default)]
pub(crate) struct RpcCoordinator {
    last_request_id: u64,
    pending: HashMap<u64, PendingCall>,
}

impl RpcCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_request_id(&mut self) -> u64 {
        self.last_request_id += 1;
        self.last_request_id
    }

    pub(crate) fn register(
        &mut self,
        request_id: u64,
        session: u64,
        promise: Promise<Bytes, SessionError>,
        timeout: Duration,
    ) {
        let now = Instant::now();
        let call = PendingCall {
            session,
            promise,
            created_at: now,
            deadline: now + timeout,
            timer: None,
        };
        if let Some(previous) = self.pending.insert(request_id, call) {
            previous.finish(Err(SessionError::Protocol(format!(
                "request id {request_id} reused"
            ))));
        }
    }

    pub(crate) fn set_timer(&mut self, request_id: u64, timer: TimerHandle) {
        match self.pending.get_mut(&request_id) {
            Some(call) => call.timer = Some(timer),
            None => timer.cancel(),
        }
    }

    /// Match a response arriving on `session` to its call. `None` if nothing
    /// on that session is waiting for it.
    pub(crate) fn complete(&mut self, session: u64, response: RpcResponse) -> Option<Outcome> {
        if self.pending.get(&response.request_id)?.session != session {
            return None;
        }
        let call = self.pending.remove(&response.request_id)?;
        tracing::trace!(
            request_id = response.request_id,
            code = %response.code,
            elapsed_us = call.created_at.elapsed().as_micros() as u64,
            "call completed"
        );
        if response.code.is_ok() {
            call.finish(Ok(response.body));
            Some(Outcome::Success)
        } else {
            let message = response.error_text().unwrap_or_default();
            call.finish(Err(SessionError::Remote {
                code: response.code,
                message,
            }));
            Some(Outcome::Failure)
        }
    }

    /// Fail a call whose timer fired.
    pub(crate) fn expire(&mut self, request_id: u64) -> Option<Outcome> {
        let call = self.pending.remove(&request_id)?;
        let waited = call.deadline.saturating_duration_since(call.created_at);
        tracing::debug!(request_id, ?waited, "call timed out");
        call.finish(Err(SessionError::Timeout(waited)));
        Some(Outcome::Timeout)
    }

    pub(crate) fn fail(&mut self, request_id: u64, error: SessionError) -> Option<Outcome> {
        let call = self.pending.remove(&request_id)?;
        call.finish(Err(error));
        Some(Outcome::Failure)
    }

    /// Fail every call issued on `session`. Returns how many were failed.
    pub(crate) fn fail_session(&mut self, session: u64, error: &SessionError) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| call.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(call) = self.pending.remove(id) {
                call.finish(Err(error.clone()));
            }
        }
        ids.len()
    }

    pub(crate) fn fail_all(&mut self, error: &SessionError) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            call.finish(Err(error.clone()));
        }
        count
    }

    pub(crate) fn pending_for(&self, session: u64) -> usize {
        self.pending
            .values()
            .filter(|call| call.session == session)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use gamewire_frame::ResultCode;
    use gamewire_loop::Completion;

    use super::*;

    fn call(
        rpc: &mut RpcCoordinator,
        session: u64,
    ) -> (u64, Completion<Bytes, SessionError>) {
        let promise = Promise::new();
        let completion = promise.completion();
        let id = rpc.next_request_id();
        rpc.register(id, session, promise, Duration::from_secs(5));
        (id, completion)
    }

    #[test]
    fn response_completes_once_and_removes_entry() {
        let mut rpc = RpcCoordinator::new();
        let (id, completion) = call(&mut rpc, 1);
        assert_eq!(
            rpc.complete(1, RpcResponse::ok(id, Bytes::from_static(b"ok"))),
            Some(Outcome::Success)
        );
        assert!(!rpc.contains(id));
        assert_eq!(completion.wait(), Ok(Bytes::from_static(b"ok")));

        // Late duplicates and expiries find nothing.
        assert_eq!(rpc.complete(1, RpcResponse::ok(id, Bytes::new())), None);
        assert_eq!(rpc.expire(id), None);
    }

    #[test]
    fn timeout_then_late_response() {
        let mut rpc = RpcCoordinator::new();
        let (id, completion) = call(&mut rpc, 1);
        assert_eq!(rpc.expire(id), Some(Outcome::Timeout));
        assert!(completion.wait().unwrap_err().is_timeout());
        assert_eq!(rpc.complete(1, RpcResponse::ok(id, Bytes::new())), None);
        assert_eq!(rpc.len(), 0);
    }

    #[test]
    fn error_codes_become_remote_failures() {
        let mut rpc = RpcCoordinator::new();
        let (id, completion) = call(&mut rpc, 1);
        rpc.complete(1, RpcResponse::error(id, ResultCode::NoSuchMethod, "10:5"));
        assert_eq!(
            completion.wait(),
            Err(SessionError::Remote {
                code: ResultCode::NoSuchMethod,
                message: "10:5".to_string(),
            })
        );
    }

    #[test]
    fn session_loss_fails_only_that_session() {
        let mut rpc = RpcCoordinator::new();
        let (_, first) = call(&mut rpc, 1);
        let (_, second) = call(&mut rpc, 1);
        let (other_id, other) = call(&mut rpc, 2);

        let closed = SessionError::SessionClosed("peer closed".to_string());
        assert_eq!(rpc.fail_session(1, &closed), 2);
        assert_eq!(first.wait(), Err(closed.clone()));
        assert_eq!(second.wait(), Err(closed));
        assert!(!other.is_done());
        assert!(rpc.contains(other_id));
    }

    #[test]
    fn responses_from_another_session_are_ignored() {
        let mut rpc = RpcCoordinator::new();
        let (id, completion) = call(&mut rpc, 1);
        assert_eq!(rpc.complete(2, RpcResponse::ok(id, Bytes::new())), None);
        assert!(!completion.is_done());
        assert!(rpc.contains(id));
    }

    #[test]
    fn request_ids_are_unique() {
        let mut rpc = RpcCoordinator::new();
        let ids: std::collections::HashSet<u64> =
            (0..1000).map(|_| rpc.next_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
