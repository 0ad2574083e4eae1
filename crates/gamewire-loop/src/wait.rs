//! Consumer wait strategies.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

const SPIN_TRIES: u32 = 100;
const YIELD_TRIES: u32 = 100;
const SLEEP_STEP: Duration = Duration::from_micros(100);

/// How the consumer idles while waiting for the next published task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// Spin on the sequence. Lowest latency, burns a core.
    BusySpin,
    /// Spin, then yield, then sleep in short steps.
    SpinSleep,
    /// Park on a condition variable with a timeout; producers signal it.
    #[default]
    TimeoutBlock,
}

impl WaitStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::BusySpin => "busy-spin",
            Self::SpinSleep => "spin-sleep",
            Self::TimeoutBlock => "timeout-block",
        }
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "busy-spin" => Ok(Self::BusySpin),
            "spin-sleep" => Ok(Self::SpinSleep),
            "timeout-block" => Ok(Self::TimeoutBlock),
            other => Err(format!(
                "unknown wait strategy '{other}' (expected busy-spin, spin-sleep or timeout-block)"
            )),
        }
    }
}

/// Runtime half of a [`WaitStrategy`], shared between the consumer and the
/// producers that signal it.
pub(crate) struct Waiter {
    strategy: WaitStrategy,
    lock: Mutex<()>,
    cond: Condvar,
    sleeping: AtomicBool,
}

impl Waiter {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            lock: Mutex::new(()),
            cond: Condvar::new(),
            sleeping: AtomicBool::new(false),
        }
    }

    /// Wait until `ready()` holds or `timeout` elapses. Returns `ready()`.
    pub(crate) fn wait_until(&self, ready: impl Fn() -> bool, timeout: Duration) -> bool {
        if ready() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        match self.strategy {
            WaitStrategy::BusySpin => loop {
                if ready() {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                std::hint::spin_loop();
            },
            WaitStrategy::SpinSleep => {
                let mut tries = 0u32;
                loop {
                    if ready() {
                        return true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    if tries < SPIN_TRIES {
                        std::hint::spin_loop();
                    } else if tries < SPIN_TRIES + YIELD_TRIES {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(SLEEP_STEP.min(deadline - now));
                    }
                    tries = tries.saturating_add(1);
                }
            }
            WaitStrategy::TimeoutBlock => {
                let mut guard = self.lock.lock();
                self.sleeping.store(true, Ordering::SeqCst);
                while !ready() {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                self.sleeping.store(false, Ordering::SeqCst);
                ready()
            }
        }
    }

    /// Wake the consumer if it is parked.
    pub(crate) fn signal(&self) {
        if self.strategy == WaitStrategy::TimeoutBlock && self.sleeping.load(Ordering::SeqCst) {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Wake the consumer unconditionally (lifecycle changes).
    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn parses_config_names() {
        for strategy in [
            WaitStrategy::BusySpin,
            WaitStrategy::SpinSleep,
            WaitStrategy::TimeoutBlock,
        ] {
            assert_eq!(strategy.name().parse::<WaitStrategy>().unwrap(), strategy);
        }
        assert!("yield".parse::<WaitStrategy>().is_err());
    }

    #[test]
    fn times_out_when_never_ready() {
        for strategy in [
            WaitStrategy::BusySpin,
            WaitStrategy::SpinSleep,
            WaitStrategy::TimeoutBlock,
        ] {
            let waiter = Waiter::new(strategy);
            let start = Instant::now();
            assert!(!waiter.wait_until(|| false, Duration::from_millis(20)));
            assert!(start.elapsed() >= Duration::from_millis(20));
        }
    }

    #[test]
    fn signal_wakes_blocked_consumer() {
        let waiter = Arc::new(Waiter::new(WaitStrategy::TimeoutBlock));
        let flag = Arc::new(AtomicBool::new(false));

        let producer = {
            let waiter = Arc::clone(&waiter);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
                waiter.signal();
            })
        };

        let start = Instant::now();
        assert!(waiter.wait_until(|| flag.load(Ordering::SeqCst), Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }
}
