//! Handshake validation and session id assignment.
//!
//! The initiator opens a session with `CONNECT_REQUEST`; the responder
//! checks the request here before creating or resuming anything.

use gamewire_frame::ConnectRequest;
use uuid::Uuid;

use crate::error::{Result, SessionError};

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LEN: usize = 128;

/// Maximum token length in bytes.
pub const MAX_TOKEN_LEN: usize = 4096;

/// Maximum session id length in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Responder-side accept hook, run on the owning loop for every
/// `CONNECT_REQUEST` (fresh or resuming) after the field checks pass.
///
/// The token is opaque to the runtime; interpreting it is up to the
/// validator. Returning `Err(reason)` answers `CONNECT_RESPONSE(success=false)`
/// with that reason and closes the link.
pub trait HandshakeValidator: Send + Sync + 'static {
    fn accept(&self, request: &ConnectRequest) -> std::result::Result<(), String>;
}

/// Accepts every well-formed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl HandshakeValidator for AcceptAll {
    fn accept(&self, _request: &ConnectRequest) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<F> HandshakeValidator for F
where
    F: Fn(&ConnectRequest) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    fn accept(&self, request: &ConnectRequest) -> std::result::Result<(), String> {
        self(request)
    }
}

/// Check the fields of an incoming request.
pub fn validate_request(request: &ConnectRequest) -> Result<()> {
    validate_identity(&request.identity)?;
    validate_token(&request.token)?;
    if request.session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::HandshakeFailed(format!(
            "invalid session_id length: {}",
            request.session_id.len()
        )));
    }
    if request.attempt == 0 {
        return Err(SessionError::HandshakeFailed(
            "attempt counter must start at 1".to_string(),
        ));
    }
    if request.sequence == 0 {
        return Err(SessionError::HandshakeFailed(
            "initial sequence must start at 1".to_string(),
        ));
    }
    if request.session_id.is_empty() && request.ack != 0 {
        return Err(SessionError::HandshakeFailed(format!(
            "fresh session cannot acknowledge sequence {}",
            request.ack
        )));
    }
    Ok(())
}

pub fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(SessionError::HandshakeFailed(format!(
            "invalid identity length: {}",
            identity.len()
        )));
    }
    Ok(())
}

pub fn validate_token(token: &[u8]) -> Result<()> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(SessionError::HandshakeFailed(format!(
            "invalid token length: {}",
            token.len()
        )));
    }
    Ok(())
}

/// Mint a session id owned by loop `loop_index`.
///
/// The owning loop is the id's prefix so a resume request arriving on a new
/// link can be routed to the loop that holds the session.
pub(crate) fn mint_session_id(loop_index: usize) -> String {
    format!("{loop_index}-{}", Uuid::new_v4().simple())
}

/// The loop index a session id was minted for.
pub(crate) fn owning_loop(session_id: &str) -> Option<usize> {
    session_id.split_once('-')?.0.parse().ok()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            identity: "scene-1".to_string(),
            session_id: String::new(),
            attempt: 1,
            sequence: 1,
            ack: 0,
            token: Bytes::from_static(b"secret"),
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        validate_request(&request()).expect("request should validate");
    }

    #[test]
    fn rejects_bad_fields() {
        let mut empty_identity = request();
        empty_identity.identity.clear();

        let mut long_identity = request();
        long_identity.identity = "x".repeat(MAX_IDENTITY_LEN + 1);

        let mut long_token = request();
        long_token.token = Bytes::from(vec![0u8; MAX_TOKEN_LEN + 1]);

        let mut zero_attempt = request();
        zero_attempt.attempt = 0;

        let mut fresh_with_ack = request();
        fresh_with_ack.ack = 3;

        let mut long_session = request();
        long_session.session_id = "s".repeat(MAX_SESSION_ID_LEN + 1);

        for bad in [
            empty_identity,
            long_identity,
            long_token,
            zero_attempt,
            fresh_with_ack,
            long_session,
        ] {
            assert!(
                matches!(validate_request(&bad), Err(SessionError::HandshakeFailed(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn resume_may_carry_ack() {
        let mut resume = request();
        resume.session_id = "0-1-abc".to_string();
        resume.ack = 12;
        resume.attempt = 2;
        validate_request(&resume).expect("resume request should validate");
    }

    #[test]
    fn session_ids_are_unique_and_routable() {
        let first = mint_session_id(3);
        let second = mint_session_id(3);
        assert_ne!(first, second);
        assert_eq!(owning_loop(&first), Some(3));
        let nonce = first.split_once('-').map(|(_, nonce)| nonce).unwrap();
        assert!(Uuid::parse_str(nonce).is_ok());
        assert!(first.len() <= MAX_SESSION_ID_LEN);
        assert_eq!(owning_loop("garbage"), None);
        assert_eq!(owning_loop("x-1-2"), None);
    }

    #[test]
    fn closures_are_validators() {
        let only_scenes = |req: &ConnectRequest| {
            if req.identity.starts_with("scene-") {
                Ok(())
            } else {
                Err(format!("identity '{}' not allowed", req.identity))
            }
        };
        assert!(only_scenes.accept(&request()).is_ok());
        let mut other = request();
        other.identity = "gate-1".to_string();
        assert!(only_scenes.accept(&other).is_err());
        assert!(AcceptAll.accept(&other).is_ok());
    }
}
