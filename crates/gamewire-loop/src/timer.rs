//! Timer queue ticked by the owning event loop.
//!
//! Callbacks run on the loop thread with the loop context. Scheduling is
//! allowed from any thread; cancellation is a flag checked before firing.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cancels a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Stop the timer. A callback already running is not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Callback<C> {
    Once(Box<dyn FnOnce(&mut C) + Send>),
    Repeat {
        period: Duration,
        callback: Box<dyn FnMut(&mut C) + Send>,
    },
}

struct Entry<C> {
    deadline: Instant,
    id: u64,
    cancelled: Arc<AtomicBool>,
    callback: Callback<C>,
}

impl<C> PartialEq for Entry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<C> Eq for Entry<C> {}

impl<C> PartialOrd for Entry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Entry<C> {
    // BinaryHeap is a max-heap; the earliest deadline must sort highest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub(crate) struct TimerQueue<C> {
    heap: Mutex<BinaryHeap<Entry<C>>>,
    next_id: AtomicU64,
}

impl<C> TimerQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn push(&self, deadline: Instant, cancelled: Arc<AtomicBool>, callback: Callback<C>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Entry {
            deadline,
            id,
            cancelled,
            callback,
        });
    }

    pub(crate) fn schedule_once(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce(&mut C) + Send>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.push(
            Instant::now() + delay,
            Arc::clone(&cancelled),
            Callback::Once(callback),
        );
        TimerHandle { cancelled }
    }

    pub(crate) fn schedule_fixed_delay(
        &self,
        initial: Duration,
        period: Duration,
        callback: Box<dyn FnMut(&mut C) + Send>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.push(
            Instant::now() + initial,
            Arc::clone(&cancelled),
            Callback::Repeat { period, callback },
        );
        TimerHandle { cancelled }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|entry| entry.deadline)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Fire every timer due at `now`. Returns how many callbacks ran.
    pub(crate) fn tick(&self, now: Instant, ctx: &mut C) -> usize {
        let due = {
            let mut heap = self.heap.lock();
            let mut due = Vec::new();
            while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = heap.pop() {
                    due.push(entry);
                }
            }
            due
        };

        let mut fired = 0;
        for entry in due {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            fired += 1;
            match entry.callback {
                Callback::Once(callback) => {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(ctx))).is_err() {
                        tracing::error!(timer = entry.id, "timer callback panicked");
                    }
                }
                Callback::Repeat {
                    period,
                    mut callback,
                } => {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(ctx))).is_err() {
                        tracing::error!(
                            timer = entry.id,
                            "periodic timer callback panicked; timer cancelled"
                        );
                        entry.cancelled.store(true, Ordering::Release);
                        continue;
                    }
                    if !entry.cancelled.load(Ordering::Acquire) {
                        self.push(
                            Instant::now() + period,
                            entry.cancelled,
                            Callback::Repeat { period, callback },
                        );
                    }
                }
            }
        }
        fired
    }

    /// Drop every pending timer. Returns how many were discarded.
    pub(crate) fn clear(&self) -> usize {
        let mut heap = self.heap.lock();
        let count = heap.len();
        heap.clear();
        count
    }
}
