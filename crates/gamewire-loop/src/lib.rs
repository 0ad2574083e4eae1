//! Event loop core for gamewire.
//!
//! An [`EventLoop`] is one worker thread draining a fixed-capacity ring of
//! tasks submitted by any number of producer threads. State that belongs to
//! the loop lives in its context value and is only touched by the worker,
//! so it needs no locking.
//!
//! Lifecycle: `NotStarted → Started → ShuttingDown → Shutdown → Terminated`.
//! After `shutdown()` new submissions go to the configured
//! [`RejectionPolicy`]; tasks already queued are run (or discarded by
//! `shutdown_now()`), producers blocked on a full ring are released, and the
//! [`EventLoop::termination`] completion resolves.

pub mod error;
pub mod event_loop;
pub mod executor;
pub mod group;
pub mod promise;
mod ring;
pub mod state;
pub mod timer;
pub mod wait;

pub use error::{LoopError, RejectReason, Result};
pub use event_loop::{
    Backpressure, EventLoop, LoopHooks, LoopOptions, RejectHandler, RejectionPolicy,
    DEFAULT_BATCH_SIZE, DEFAULT_RING_SIZE, DEFAULT_TICK_INTERVAL,
};
pub use executor::{Executor, ImmediateExecutor, Runnable};
pub use group::EventLoopGroup;
pub use promise::{Completion, Promise};
pub use state::LoopState;
pub use timer::TimerHandle;
pub use wait::WaitStrategy;
