use crate::error::SessionError;
use crate::session::SessionInfo;

/// Observes session lifecycle transitions.
///
/// Callbacks run on the session's event loop and must not block. Each
/// session produces at most one `on_active` and, if it was active, exactly
/// one `on_inactive`.
pub trait SessionListener: Send + Sync + 'static {
    fn on_active(&self, _session: &SessionInfo) {}

    fn on_inactive(&self, _session: &SessionInfo, _reason: &SessionError) {}
}
