use std::fmt;

/// Why a task could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The loop has begun shutting down.
    ShuttingDown,
    /// The ring buffer is full and the loop does not block producers.
    CapacityExceeded,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => f.write_str("event loop is shutting down"),
            Self::CapacityExceeded => f.write_str("ring buffer capacity exceeded"),
        }
    }
}

/// Errors surfaced by event loops, groups and timers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// A task was routed to the rejection policy and the policy refused it.
    #[error("task rejected by {loop_name}: {reason}")]
    Rejected {
        loop_name: String,
        reason: RejectReason,
    },

    /// Loop options failed validation.
    #[error("invalid event loop configuration: {0}")]
    InvalidConfig(String),

    /// The worker thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(String),
}

impl LoopError {
    pub(crate) fn rejected(loop_name: &str, reason: RejectReason) -> Self {
        Self::Rejected {
            loop_name: loop_name.to_string(),
            reason,
        }
    }

    /// The rejection reason, when this error is a rejection.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;
