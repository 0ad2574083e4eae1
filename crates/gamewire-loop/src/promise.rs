//! Write-once result cells: [`Promise`] is the write half, [`Completion`]
//! the read half.
//!
//! A promise completes at most once; later attempts return `false` and are
//! otherwise ignored. Readers may block ([`Completion::wait`]), register a
//! callback, or `.await` the completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::Executor;

type Callback<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send + 'static>;

struct Waiters<T, E> {
    callbacks: Vec<Callback<T, E>>,
    wakers: Vec<Waker>,
}

struct Shared<T, E> {
    result: OnceLock<Result<T, E>>,
    waiters: Mutex<Waiters<T, E>>,
    cond: Condvar,
    writers: AtomicUsize,
    abandon: Option<fn() -> E>,
}

impl<T, E> Shared<T, E> {
    fn new(abandon: Option<fn() -> E>) -> Arc<Self> {
        Arc::new(Self {
            result: OnceLock::new(),
            waiters: Mutex::new(Waiters {
                callbacks: Vec::new(),
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
            writers: AtomicUsize::new(1),
            abandon,
        })
    }

    fn complete(&self, result: Result<T, E>) -> bool {
        let (callbacks, wakers) = {
            let mut waiters = self.waiters.lock();
            if self.result.set(result).is_err() {
                return false;
            }
            self.cond.notify_all();
            (
                std::mem::take(&mut waiters.callbacks),
                std::mem::take(&mut waiters.wakers),
            )
        };
        if let Some(result) = self.result.get() {
            for callback in callbacks {
                callback(result);
            }
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// The write half of an asynchronous result.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Promise<T, E> {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(None),
        }
    }

    /// A promise that fails with `abandon()` if every write half is dropped
    /// before it completes.
    pub fn with_abandon_error(abandon: fn() -> E) -> Self {
        Self {
            shared: Shared::new(Some(abandon)),
        }
    }

    /// A read half observing this promise.
    pub fn completion(&self) -> Completion<T, E> {
        Completion {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Complete the promise. Returns `false` if it was already completed.
    pub fn try_complete(&self, result: Result<T, E>) -> bool {
        self.shared.complete(result)
    }

    pub fn try_success(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn try_failure(&self, error: E) -> bool {
        self.try_complete(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.shared.result.get().is_some()
    }
}

impl<T, E> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Drop for Promise<T, E> {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(abandon) = self.shared.abandon {
            if self.shared.result.get().is_none() {
                self.shared.complete(Err(abandon()));
            }
        }
    }
}

impl<T, E> std::fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

/// The read half of an asynchronous result.
pub struct Completion<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Completion<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> std::fmt::Debug for Completion<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl<T, E> Completion<T, E> {
    /// An already completed result.
    pub fn ready(result: Result<T, E>) -> Self {
        let promise = Promise::new();
        promise.try_complete(result);
        promise.completion()
    }

    pub fn is_done(&self) -> bool {
        self.shared.result.get().is_some()
    }

    /// Borrow the result if it is available.
    pub fn result(&self) -> Option<&Result<T, E>> {
        self.shared.result.get()
    }

    /// Register a callback run with the result.
    ///
    /// Runs on the completing thread, or immediately on the calling thread
    /// when the result is already available.
    pub fn on_complete(&self, callback: impl FnOnce(&Result<T, E>) + Send + 'static) {
        {
            let mut waiters = self.shared.waiters.lock();
            if self.shared.result.get().is_none() {
                waiters.callbacks.push(Box::new(callback));
                return;
            }
        }
        if let Some(result) = self.shared.result.get() {
            callback(result);
        }
    }

    /// Wait for the result, up to `timeout`. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<&Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut waiters = self.shared.waiters.lock();
        while self.shared.result.get().is_none() {
            if self.shared.cond.wait_until(&mut waiters, deadline).timed_out() {
                break;
            }
        }
        drop(waiters);
        self.shared.result.get()
    }
}

impl<T, E> Completion<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Block until the result is available.
    pub fn wait(&self) -> Result<T, E> {
        let mut waiters = self.shared.waiters.lock();
        loop {
            if let Some(result) = self.shared.result.get() {
                return result.clone();
            }
            self.shared.cond.wait(&mut waiters);
        }
    }

    /// Register a callback that runs on `executor` instead of the completing
    /// thread. If the executor rejects the task the callback runs inline.
    pub fn on_complete_via(
        &self,
        executor: Arc<dyn Executor>,
        callback: impl FnOnce(Result<T, E>) + Send + 'static,
    ) {
        self.on_complete(move |result| {
            let result = result.clone();
            let slot = Arc::new(Mutex::new(Some((callback, result))));
            let task_slot = Arc::clone(&slot);
            let submitted = executor.execute(Box::new(move || {
                if let Some((callback, result)) = task_slot.lock().take() {
                    callback(result);
                }
            }));
            if let Err(err) = submitted {
                tracing::warn!(error = %err, "completion callback rejected; running inline");
                if let Some((callback, result)) = slot.lock().take() {
                    callback(result);
                }
            }
        });
    }
}

impl<T, E> Future for Completion<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut waiters = self.shared.waiters.lock();
        if let Some(result) = self.shared.result.get() {
            return Poll::Ready(result.clone());
        }
        if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
