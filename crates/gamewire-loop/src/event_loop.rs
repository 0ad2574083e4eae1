//! The single-consumer event loop.
//!
//! Every loop owns one worker thread, started lazily by the first
//! submission, and a context value `C` built on that thread. Tasks either
//! borrow the context (`submit`) or ignore it (`execute`). Nothing outside
//! the worker thread ever touches the context.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{LoopError, RejectReason, Result};
use crate::executor::{Executor, Runnable};
use crate::promise::{Completion, Promise};
use crate::ring::RingBuffer;
use crate::state::{AtomicLoopState, LoopState};
use crate::timer::{TimerHandle, TimerQueue};
use crate::wait::{WaitStrategy, Waiter};

/// Default ring capacity (tasks).
pub const DEFAULT_RING_SIZE: usize = 8192;

/// Default number of tasks processed between `loop_once` passes.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Default upper bound on how long the worker idles between passes.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle hooks run by the worker thread against the loop context.
pub trait LoopHooks: 'static {
    /// Runs once, right after the context is built.
    fn on_start(&mut self) {}

    /// Runs after every batch and every idle wake-up, after timers fire.
    fn loop_once(&mut self) {}

    /// Runs once after the ring has been drained, before termination.
    fn clean_up(&mut self) {}
}

impl LoopHooks for () {}

/// What a producer does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait for the consumer to free a slot.
    #[default]
    Block,
    /// Route the task to the rejection policy with `CapacityExceeded`.
    Reject,
}

/// Custom rejection handler: receives the loop name and the reason.
pub type RejectHandler = Arc<dyn Fn(&str, RejectReason) -> Result<()> + Send + Sync>;

/// What happens to a task that cannot be enqueued.
#[derive(Clone, Default)]
pub enum RejectionPolicy {
    /// Fail the submission with [`LoopError::Rejected`].
    #[default]
    Abort,
    /// Run plain tasks inline on the submitting thread. Context tasks cannot
    /// run off the loop and are aborted.
    CallerRuns,
    /// Hand the rejection to a custom handler whose result is returned to
    /// the submitter.
    Custom(RejectHandler),
}

impl fmt::Debug for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("Abort"),
            Self::CallerRuns => f.write_str("CallerRuns"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Event loop configuration.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Ring capacity; must be a power of two.
    pub ring_size: usize,
    pub batch_size: usize,
    pub wait_strategy: WaitStrategy,
    pub backpressure: Backpressure,
    pub rejection: RejectionPolicy,
    pub tick_interval: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            wait_strategy: WaitStrategy::default(),
            backpressure: Backpressure::default(),
            rejection: RejectionPolicy::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl LoopOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.ring_size.is_power_of_two() {
            return Err(LoopError::InvalidConfig(format!(
                "ring size must be a power of two, got {}",
                self.ring_size
            )));
        }
        if self.batch_size == 0 {
            return Err(LoopError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(LoopError::InvalidConfig(
                "tick interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

type ContextTask<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;
type Factory<C> = Box<dyn FnOnce(&EventLoop<C>) -> C + Send + 'static>;

enum Job<C> {
    Context(ContextTask<C>),
    Plain(Runnable),
}

struct Inner<C> {
    name: String,
    options: LoopOptions,
    state: AtomicLoopState,
    ring: RingBuffer<Job<C>>,
    consumer: Arc<AtomicU64>,
    waiter: Waiter,
    timers: TimerQueue<C>,
    discard_pending: AtomicBool,
    thread: OnceLock<ThreadId>,
    factory: Mutex<Option<Factory<C>>>,
    termination: Promise<(), LoopError>,
}

/// A single-consumer, multi-producer task executor with a loop-confined
/// context. Cheap to clone; all clones drive the same loop.
pub struct EventLoop<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for EventLoop<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.load())
            .finish_non_exhaustive()
    }
}

impl EventLoop<()> {
    /// A loop without context, usable as a general-purpose executor.
    pub fn plain(name: impl Into<String>, options: LoopOptions) -> Result<Self> {
        Self::new(name, options, |_| ())
    }
}

impl<C: LoopHooks> EventLoop<C> {
    /// Create a loop. `factory` runs on the worker thread when it starts.
    pub fn new(
        name: impl Into<String>,
        options: LoopOptions,
        factory: impl FnOnce(&EventLoop<C>) -> C + Send + 'static,
    ) -> Result<Self> {
        options.validate()?;
        let ring = RingBuffer::new(options.ring_size);
        let consumer = Arc::new(AtomicU64::new(0));
        ring.add_gating(Arc::clone(&consumer));
        let waiter = Waiter::new(options.wait_strategy);
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                state: AtomicLoopState::new(),
                ring,
                consumer,
                waiter,
                timers: TimerQueue::new(),
                discard_pending: AtomicBool::new(false),
                thread: OnceLock::new(),
                factory: Mutex::new(Some(Box::new(factory))),
                termination: Promise::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &LoopOptions {
        &self.inner.options
    }

    pub fn state(&self) -> LoopState {
        self.inner.state.load()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == LoopState::Terminated
    }

    /// Whether the calling thread is this loop's worker.
    pub fn in_event_loop(&self) -> bool {
        self.inner.thread.get() == Some(&thread::current().id())
    }

    /// Approximate number of tasks queued but not yet taken by the worker.
    pub fn pending_tasks(&self) -> usize {
        if self.state() >= LoopState::Shutdown {
            return 0;
        }
        let cursor = self.inner.ring.cursor();
        let consumed = self.inner.consumer.load(Ordering::Acquire);
        (cursor.saturating_sub(consumed) as usize).min(self.inner.ring.capacity())
    }

    /// Submit a task that runs on the worker with the loop context.
    pub fn submit(&self, task: impl FnOnce(&mut C) + Send + 'static) -> Result<()> {
        self.dispatch(Job::Context(Box::new(task)))
    }

    /// Submit a task that does not need the loop context.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.dispatch(Job::Plain(Box::new(task)))
    }

    /// Run `callback` on the loop after `delay`.
    pub fn schedule_once(
        &self,
        delay: Duration,
        callback: impl FnOnce(&mut C) + Send + 'static,
    ) -> Result<TimerHandle> {
        self.check_accepting()?;
        let handle = self.inner.timers.schedule_once(delay, Box::new(callback));
        self.ensure_started();
        self.inner.waiter.signal();
        Ok(handle)
    }

    /// Run `callback` on the loop after `initial`, then `period` after each
    /// run completes, until cancelled.
    pub fn schedule_fixed_delay(
        &self,
        initial: Duration,
        period: Duration,
        callback: impl FnMut(&mut C) + Send + 'static,
    ) -> Result<TimerHandle> {
        self.check_accepting()?;
        let handle = self
            .inner
            .timers
            .schedule_fixed_delay(initial, period, Box::new(callback));
        self.ensure_started();
        self.inner.waiter.signal();
        Ok(handle)
    }

    /// Stop accepting tasks; run everything already queued, then terminate.
    pub fn shutdown(&self) {
        self.begin_shutdown(false);
    }

    /// Stop accepting tasks; discard everything queued, then terminate.
    pub fn shutdown_now(&self) {
        self.begin_shutdown(true);
    }

    /// Resolves once the loop reaches `Terminated`.
    pub fn termination(&self) -> Completion<(), LoopError> {
        self.inner.termination.completion()
    }

    /// Block until terminated or `timeout` elapses. Returns whether the loop
    /// terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.termination().wait_timeout(timeout).is_some()
    }

    fn check_accepting(&self) -> Result<()> {
        if self.inner.ring.is_sealed() {
            return Err(LoopError::rejected(
                &self.inner.name,
                RejectReason::ShuttingDown,
            ));
        }
        Ok(())
    }

    fn dispatch(&self, job: Job<C>) -> Result<()> {
        let inner = &self.inner;
        // The worker must never park on its own ring.
        let block = inner.options.backpressure == Backpressure::Block && !self.in_event_loop();
        match inner.ring.claim(block) {
            Ok(sequence) => {
                inner.ring.publish(sequence, job);
                self.ensure_started();
                inner.waiter.signal();
                Ok(())
            }
            Err(reason) => self.reject(job, reason),
        }
    }

    fn reject(&self, job: Job<C>, reason: RejectReason) -> Result<()> {
        let name = &self.inner.name;
        tracing::debug!(event_loop = %name, %reason, "task rejected");
        match &self.inner.options.rejection {
            RejectionPolicy::Abort => Err(LoopError::rejected(name, reason)),
            RejectionPolicy::CallerRuns => match job {
                Job::Plain(task) => {
                    task();
                    Ok(())
                }
                Job::Context(_) => Err(LoopError::rejected(name, reason)),
            },
            RejectionPolicy::Custom(handler) => handler(name, reason),
        }
    }

    fn ensure_started(&self) {
        if self.inner.state.load() == LoopState::NotStarted
            && self
                .inner
                .state
                .transition(LoopState::NotStarted, LoopState::Started)
        {
            self.spawn_worker();
        }
    }

    fn begin_shutdown(&self, discard: bool) {
        let inner = &self.inner;
        if discard {
            inner.discard_pending.store(true, Ordering::Release);
        }
        inner.ring.seal();
        match inner.state.advance(LoopState::ShuttingDown) {
            Some(LoopState::NotStarted) => {
                tracing::debug!(event_loop = %inner.name, "shutdown before start");
                self.spawn_worker();
            }
            Some(_) => {
                tracing::debug!(event_loop = %inner.name, discard, "shutdown requested");
                inner.waiter.wake();
            }
            None => {}
        }
    }

    fn spawn_worker(&self) {
        let Some(factory) = self.inner.factory.lock().take() else {
            return;
        };
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || worker.run(factory));
        if let Err(err) = spawned {
            tracing::error!(
                event_loop = %self.inner.name,
                error = %err,
                "failed to spawn event loop thread"
            );
            self.inner.ring.seal();
            self.inner.state.advance(LoopState::Terminated);
            self.inner
                .termination
                .try_failure(LoopError::Spawn(err.to_string()));
        }
    }

    fn run(self, factory: Factory<C>) {
        let inner = &self.inner;
        let _ = inner.thread.set(thread::current().id());
        tracing::debug!(event_loop = %inner.name, "event loop started");

        let mut ctx = factory(&self);
        guarded(&inner.name, "on_start", || ctx.on_start());

        let mut next = inner.consumer.load(Ordering::Acquire);
        loop {
            let processed = self.run_batch(&mut next, &mut ctx);
            inner.timers.tick(Instant::now(), &mut ctx);
            guarded(&inner.name, "loop_once", || ctx.loop_once());

            if inner.state.load().is_shutting_down() {
                break;
            }
            if processed == 0 {
                let timeout = self.idle_timeout();
                inner.waiter.wait_until(
                    || inner.ring.is_published(next) || inner.state.load().is_shutting_down(),
                    timeout,
                );
            }
        }

        let (executed, discarded) = self.drain(next, &mut ctx);
        let timers = inner.timers.clear();
        inner.state.advance(LoopState::Shutdown);
        guarded(&inner.name, "clean_up", || ctx.clean_up());
        drop(ctx);

        if discarded > 0 {
            tracing::warn!(
                event_loop = %inner.name,
                discarded,
                "discarded queued tasks on shutdown"
            );
        }
        tracing::debug!(event_loop = %inner.name, executed, timers, "event loop terminated");
        inner.state.advance(LoopState::Terminated);
        inner.termination.try_success(());
    }

    fn run_batch(&self, next: &mut u64, ctx: &mut C) -> usize {
        let inner = &self.inner;
        let mut processed = 0;
        while processed < inner.options.batch_size
            && !inner.state.load().is_shutting_down()
            && inner.ring.is_published(*next)
        {
            let job = inner.ring.take(*next);
            *next += 1;
            inner.ring.release(&inner.consumer, *next);
            if let Some(job) = job {
                self.run_job(job, ctx);
            }
            processed += 1;
        }
        if processed > 0 {
            inner.ring.notify_space();
        }
        processed
    }

    /// Detach from the gating set, claim what is left of the ring, then run
    /// or discard every task published before the claim.
    fn drain(&self, mut next: u64, ctx: &mut C) -> (usize, usize) {
        let inner = &self.inner;
        inner.ring.seal();
        inner.ring.remove_gating(&inner.consumer);
        let end = inner.ring.claim_remaining();

        let (mut executed, mut discarded) = (0usize, 0usize);
        while next < end {
            if !inner.ring.is_published(next) {
                // Claimed by a producer that has not published yet.
                thread::yield_now();
                continue;
            }
            if let Some(job) = inner.ring.take(next) {
                if inner.discard_pending.load(Ordering::Acquire) {
                    drop(job);
                    discarded += 1;
                } else {
                    self.run_job(job, ctx);
                    executed += 1;
                }
            }
            next += 1;
            inner.consumer.store(next, Ordering::Release);
        }
        (executed, discarded)
    }

    fn run_job(&self, job: Job<C>, ctx: &mut C) {
        let outcome = match job {
            Job::Context(task) => std::panic::catch_unwind(AssertUnwindSafe(|| task(ctx))),
            Job::Plain(task) => std::panic::catch_unwind(AssertUnwindSafe(task)),
        };
        if let Err(payload) = outcome {
            tracing::error!(
                event_loop = %self.inner.name,
                panic = %panic_message(payload.as_ref()),
                "task panicked"
            );
        }
    }

    fn idle_timeout(&self) -> Duration {
        let tick = self.inner.options.tick_interval;
        match self.inner.timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(tick),
            None => tick,
        }
    }
}

impl<C: LoopHooks> Executor for EventLoop<C> {
    fn execute(&self, task: Runnable) -> Result<()> {
        self.dispatch(Job::Plain(task))
    }

    fn in_event_loop(&self) -> bool {
        EventLoop::in_event_loop(self)
    }
}

fn guarded(loop_name: &str, hook: &'static str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            event_loop = %loop_name,
            hook,
            panic = %panic_message(payload.as_ref()),
            "loop hook panicked"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn small(ring_size: usize) -> LoopOptions {
        LoopOptions {
            ring_size,
            batch_size: 16,
            ..LoopOptions::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u32>,
        ticks: usize,
        out: Option<mpsc::Sender<Vec<u32>>>,
    }

    impl LoopHooks for Recorder {
        fn loop_once(&mut self) {
            self.ticks += 1;
        }

        fn clean_up(&mut self) {
            if let Some(out) = self.out.take() {
                let _ = out.send(std::mem::take(&mut self.seen));
            }
        }
    }

    #[test]
    fn rejects_bad_options() {
        assert!(EventLoop::plain("bad", small(1000)).is_err());
        let zero_batch = LoopOptions {
            batch_size: 0,
            ..LoopOptions::default()
        };
        assert!(EventLoop::plain("bad", zero_batch).is_err());
    }

    #[test]
    fn starts_lazily_on_first_task() {
        let event_loop = EventLoop::plain("lazy", small(64)).unwrap();
        assert_eq!(event_loop.state(), LoopState::NotStarted);

        let (tx, rx) = mpsc::channel();
        let probe = event_loop.clone();
        event_loop
            .execute(move || tx.send(probe.in_event_loop()).unwrap())
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert_eq!(event_loop.state(), LoopState::Started);
        assert!(!event_loop.in_event_loop());

        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
        assert_eq!(event_loop.state(), LoopState::Terminated);
    }

    #[test]
    fn context_tasks_run_in_submission_order() {
        let (tx, rx) = mpsc::channel();
        let event_loop = EventLoop::new("ordered", small(8), move |_| Recorder {
            out: Some(tx),
            ..Recorder::default()
        })
        .unwrap();

        for value in 0..100 {
            event_loop.submit(move |ctx: &mut Recorder| ctx.seen.push(value)).unwrap();
        }
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let event_loop = EventLoop::plain("panics", small(64)).unwrap();
        event_loop.execute(|| panic!("task blew up")).unwrap();

        let (tx, rx) = mpsc::channel();
        event_loop.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let event_loop = EventLoop::plain("closed", small(64)).unwrap();
        event_loop.execute(|| {}).unwrap();
        event_loop.shutdown();

        let err = event_loop.execute(|| {}).unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::ShuttingDown));
        assert!(event_loop
            .schedule_once(Duration::ZERO, |_| {})
            .is_err());
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn shutdown_before_start_still_terminates() {
        let event_loop = EventLoop::plain("idle", small(64)).unwrap();
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
        assert!(event_loop.termination().result().is_some_and(|r| r.is_ok()));
    }

    #[test]
    fn graceful_shutdown_runs_queued_tasks() {
        let event_loop = EventLoop::plain("graceful", small(256)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        event_loop
            .execute(move || {
                let _ = gate_rx.recv_timeout(WAIT);
            })
            .unwrap();
        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            event_loop
                .execute(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        event_loop.shutdown();
        gate_tx.send(()).unwrap();

        assert!(event_loop.await_termination(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn shutdown_now_discards_queued_tasks() {
        let event_loop = EventLoop::plain("hard-stop", small(256)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        event_loop
            .execute(move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(WAIT);
            })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        for _ in 0..20 {
            let ran = Arc::clone(&ran);
            event_loop
                .execute(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        event_loop.shutdown_now();
        gate_tx.send(()).unwrap();

        assert!(event_loop.await_termination(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn caller_runs_policy_executes_inline() {
        let options = LoopOptions {
            rejection: RejectionPolicy::CallerRuns,
            ..small(64)
        };
        let event_loop = EventLoop::plain("caller-runs", options).unwrap();
        event_loop.shutdown();

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        event_loop
            .execute(move || *slot.lock() = Some(thread::current().id()))
            .unwrap();
        assert_eq!(*ran_on.lock(), Some(caller));
        assert!(event_loop.submit(|_| {}).is_err());
    }

    #[test]
    fn custom_policy_sees_capacity_rejections() {
        let rejected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rejected);
        let options = LoopOptions {
            backpressure: Backpressure::Reject,
            rejection: RejectionPolicy::Custom(Arc::new(move |_, reason| {
                assert_eq!(reason, RejectReason::CapacityExceeded);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            ..small(2)
        };
        let event_loop = EventLoop::plain("tiny", options).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        event_loop
            .execute(move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(WAIT);
            })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        for _ in 0..5 {
            event_loop.execute(|| {}).unwrap();
        }
        assert_eq!(rejected.load(Ordering::SeqCst), 3);

        gate_tx.send(()).unwrap();
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn worker_never_blocks_on_its_own_full_ring() {
        let event_loop = EventLoop::plain("self-submit", small(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        let this = event_loop.clone();
        event_loop
            .execute(move || {
                let outcomes: Vec<bool> = (0..4).map(|_| this.execute(|| {}).is_ok()).collect();
                tx.send(outcomes).unwrap();
            })
            .unwrap();
        let outcomes = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcomes, vec![true, true, false, false]);
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn timers_fire_on_loop_thread_with_context() {
        let (tx, rx) = mpsc::channel();
        let event_loop = EventLoop::new("timers", small(64), |_| Recorder::default()).unwrap();
        let start = Instant::now();
        event_loop
            .schedule_once(Duration::from_millis(30), move |ctx: &mut Recorder| {
                tx.send((start.elapsed(), ctx.ticks > 0)).unwrap();
            })
            .unwrap();

        let (elapsed, ticked) = rx.recv_timeout(WAIT).unwrap();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_secs(2));
        assert!(ticked);
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn fixed_delay_timer_repeats_until_cancelled() {
        let event_loop = EventLoop::plain("repeat", small(64)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = event_loop
            .schedule_fixed_delay(Duration::ZERO, Duration::from_millis(5), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let deadline = Instant::now() + WAIT;
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        assert!(count.load(Ordering::SeqCst) >= 3);
        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
    }

    #[test]
    fn every_wait_strategy_delivers() {
        for strategy in [
            WaitStrategy::BusySpin,
            WaitStrategy::SpinSleep,
            WaitStrategy::TimeoutBlock,
        ] {
            let options = LoopOptions {
                wait_strategy: strategy,
                ..small(64)
            };
            let event_loop = EventLoop::plain(format!("wait-{strategy}"), options).unwrap();
            let (tx, rx) = mpsc::channel();
            for value in 0..200u32 {
                let tx = tx.clone();
                event_loop.execute(move || tx.send(value).unwrap()).unwrap();
            }
            let received: Vec<u32> = (0..200).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
            assert_eq!(received, (0..200).collect::<Vec<_>>());
            event_loop.shutdown();
            assert!(event_loop.await_termination(WAIT));
        }
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
