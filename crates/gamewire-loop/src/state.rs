//! Loop lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an event loop. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Started = 1,
    ShuttingDown = 2,
    Shutdown = 3,
    Terminated = 4,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Started,
            2 => Self::ShuttingDown,
            3 => Self::Shutdown,
            _ => Self::Terminated,
        }
    }

    /// Whether new submissions are refused in this state.
    pub fn is_shutting_down(self) -> bool {
        self >= Self::ShuttingDown
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Started => "started",
            Self::ShuttingDown => "shutting-down",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomic cell holding a [`LoopState`], mutated only by compare-and-swap.
#[derive(Debug)]
pub(crate) struct AtomicLoopState(AtomicU8);

impl AtomicLoopState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LoopState::NotStarted as u8))
    }

    pub(crate) fn load(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from → to`. Fails if the current state is not `from`.
    pub(crate) fn transition(&self, from: LoopState, to: LoopState) -> bool {
        debug_assert!(to > from);
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move forward to `to` from whatever earlier state is current.
    ///
    /// Returns the state that was replaced, or `None` when the current state
    /// is already at or past `to`.
    pub(crate) fn advance(&self, to: LoopState) -> Option<LoopState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return Some(LoopState::from_u8(previous)),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_never_regress() {
        let state = AtomicLoopState::new();
        assert!(state.transition(LoopState::NotStarted, LoopState::Started));
        assert!(!state.transition(LoopState::NotStarted, LoopState::Started));
        assert_eq!(state.advance(LoopState::Shutdown), Some(LoopState::Started));
        assert_eq!(state.advance(LoopState::ShuttingDown), None);
        assert_eq!(state.load(), LoopState::Shutdown);
        assert!(state.load().is_shutting_down());
    }
}
