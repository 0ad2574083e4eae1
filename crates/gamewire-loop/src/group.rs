use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LoopError, Result};
use crate::event_loop::{EventLoop, LoopHooks, LoopOptions};

/// A fixed set of event loops with a round-robin chooser.
pub struct EventLoopGroup<C> {
    loops: Vec<EventLoop<C>>,
    next: AtomicUsize,
}

impl<C: LoopHooks> EventLoopGroup<C> {
    /// Create `threads` loops named `{name}-{index}`.
    ///
    /// `factory` builds each loop's context on that loop's worker thread.
    pub fn new<F>(name: &str, threads: usize, options: LoopOptions, factory: F) -> Result<Self>
    where
        F: Fn(usize, &EventLoop<C>) -> C + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(LoopError::InvalidConfig(
                "an event loop group needs at least one loop".to_string(),
            ));
        }
        let factory = Arc::new(factory);
        let loops = (0..threads)
            .map(|index| {
                let factory = Arc::clone(&factory);
                EventLoop::new(
                    format!("{name}-{index}"),
                    options.clone(),
                    move |event_loop: &EventLoop<C>| factory(index, event_loop),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Choose the next loop, round-robin.
    pub fn next(&self) -> &EventLoop<C> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    pub fn loops(&self) -> &[EventLoop<C>] {
        &self.loops
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn shutdown_gracefully(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }

    pub fn shutdown_now(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown_now();
        }
    }

    /// Wait for every loop to terminate within one shared deadline.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.loops.iter().all(|event_loop| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            event_loop.await_termination(remaining)
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.loops.iter().all(EventLoop::is_terminated)
    }
}
