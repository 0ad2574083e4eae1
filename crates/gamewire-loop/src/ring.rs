//! Multi-producer, single-consumer ring buffer of task slots.
//!
//! Producers claim a sequence by CAS on the cursor, fill the slot, then
//! publish the sequence in a per-slot availability array. The consumer reads
//! contiguous published sequences and advances its gating sequence, which is
//! what producers wait on for free capacity.
//!
//! Shutdown ordering: [`RingBuffer::seal`], then
//! [`RingBuffer::remove_gating`] (wakes producers parked on capacity), then
//! [`RingBuffer::claim_remaining`]. A producer loads the cursor before it
//! checks the seal, so any claim that succeeds is below the value returned
//! by `claim_remaining` and gets drained.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::RejectReason;

const SPACE_WAIT: Duration = Duration::from_millis(1);

pub(crate) struct RingBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    /// `sequence + 1` of the last publish into each slot; 0 means never.
    published: Box<[AtomicU64]>,
    mask: u64,
    capacity: u64,
    /// Next sequence a producer will claim.
    cursor: AtomicU64,
    gating: RwLock<Vec<Arc<AtomicU64>>>,
    sealed: AtomicBool,
    space_lock: Mutex<()>,
    space: Condvar,
    parked_producers: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        let published = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            slots,
            published,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            cursor: AtomicU64::new(0),
            gating: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            space_lock: Mutex::new(()),
            space: Condvar::new(),
            parked_producers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Next sequence a producer would claim.
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub(crate) fn add_gating(&self, sequence: Arc<AtomicU64>) {
        self.gating.write().push(sequence);
    }

    /// Remove a gating sequence and wake every producer parked on capacity.
    pub(crate) fn remove_gating(&self, sequence: &Arc<AtomicU64>) -> bool {
        let removed = {
            let mut gating = self.gating.write();
            let before = gating.len();
            gating.retain(|seq| !Arc::ptr_eq(seq, sequence));
            gating.len() != before
        };
        self.wake_producers(true);
        removed
    }

    fn min_gating(&self) -> Option<u64> {
        self.gating
            .read()
            .iter()
            .map(|seq| seq.load(Ordering::Acquire))
            .min()
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Claim the next sequence.
    ///
    /// With `block`, a full ring parks the producer until the consumer frees
    /// a slot; otherwise a full ring is `CapacityExceeded`. A sealed ring, or
    /// one whose consumer has left, is `ShuttingDown`.
    pub(crate) fn claim(&self, block: bool) -> Result<u64, RejectReason> {
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            if self.is_sealed() {
                return Err(RejectReason::ShuttingDown);
            }
            let Some(gate) = self.min_gating() else {
                return Err(RejectReason::ShuttingDown);
            };
            if current >= gate + self.capacity {
                if !block {
                    return Err(RejectReason::CapacityExceeded);
                }
                self.park_for_space(current);
                continue;
            }
            if self
                .cursor
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    fn park_for_space(&self, seen_cursor: u64) {
        self.parked_producers.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.space_lock.lock();
            let still_full = match self.min_gating() {
                Some(gate) => seen_cursor >= gate + self.capacity,
                None => false,
            };
            if still_full && !self.is_sealed() {
                self.space.wait_for(&mut guard, SPACE_WAIT);
            }
        }
        self.parked_producers.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_producers(&self, always: bool) {
        if always || self.parked_producers.load(Ordering::SeqCst) > 0 {
            let _guard = self.space_lock.lock();
            self.space.notify_all();
        }
    }

    /// Fill a claimed slot and make it visible to the consumer.
    pub(crate) fn publish(&self, sequence: u64, item: T) {
        let index = (sequence & self.mask) as usize;
        *self.slots[index].lock() = Some(item);
        self.published[index].store(sequence + 1, Ordering::SeqCst);
    }

    pub(crate) fn is_published(&self, sequence: u64) -> bool {
        let index = (sequence & self.mask) as usize;
        self.published[index].load(Ordering::SeqCst) == sequence + 1
    }

    /// Take the item at a published sequence. Consumer only.
    pub(crate) fn take(&self, sequence: u64) -> Option<T> {
        let index = (sequence & self.mask) as usize;
        self.slots[index].lock().take()
    }

    /// Advance the consumer's gating sequence to `next`.
    pub(crate) fn release(&self, consumer: &AtomicU64, next: u64) {
        consumer.store(next, Ordering::Release);
    }

    /// Wake producers parked on capacity after a batch was released.
    pub(crate) fn notify_space(&self) {
        self.wake_producers(false);
    }

    /// Move the cursor past a full ring's worth of sequences.
    ///
    /// Returns the first sequence no producer can own. Every sequence below
    /// it was claimed by a producer and will be published.
    pub(crate) fn claim_remaining(&self) -> u64 {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            match self.cursor.compare_exchange_weak(
                current,
                current + self.capacity,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}
