//! Exclusive access to the hardware counter unit.
//!
//! Two strategies implement [`CounterUnitLock`]:
//!
//! - [`RetryBeginLock`]: there is no lock object. A query begin may report
//!   the unit busy, and the begin is retried with a fixed backoff until it
//!   starts or the attempt budget runs out.
//! - [`ExplicitLock`]: an explicit acquire/release pair brackets the whole
//!   measurement, including every pass. A begin that still reports busy
//!   while the lock is held is a driver contract violation.
//!
//! The orchestrator holds either one through a [`LockGuard`], so the unit is
//! released on every exit path.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProbeError, Result};
use crate::query::BeginStatus;

pub trait CounterUnitLock {
    /// Take the unit for the whole measurement.
    fn acquire(&mut self) -> Result<()>;

    /// Drive one query begin to completion under this lock's policy.
    fn begin(&mut self, attempt: &mut dyn FnMut() -> Result<BeginStatus>) -> Result<()>;

    /// Give the unit back. Must be safe to call when not held.
    fn release(&mut self);

    fn is_held(&self) -> bool;
}

// ── Retry strategy ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total begin attempts, the first one included.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 500,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Where the retry loop sleeps. Swapped out in tests.
pub trait Backoff {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl Backoff for ThreadSleep {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub struct RetryBeginLock<B = ThreadSleep> {
    policy: RetryPolicy,
    backoff: B,
    held: bool,
}

impl<B: Backoff> RetryBeginLock<B> {
    pub fn new(policy: RetryPolicy, backoff: B) -> Self {
        Self {
            policy,
            backoff,
            held: false,
        }
    }

    pub fn backoff(&self) -> &B {
        &self.backoff
    }
}

impl<B: Backoff> CounterUnitLock for RetryBeginLock<B> {
    fn acquire(&mut self) -> Result<()> {
        self.held = true;
        Ok(())
    }

    fn begin(&mut self, attempt: &mut dyn FnMut() -> Result<BeginStatus>) -> Result<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        for n in 1..=max_attempts {
            match attempt()? {
                BeginStatus::Started => {
                    if n > 1 {
                        debug!(attempts = n, "query begin succeeded after contention");
                    }
                    return Ok(());
                }
                BeginStatus::Busy if n < max_attempts => {
                    debug!(
                        attempt = n,
                        backoff_ms = self.policy.backoff.as_millis() as u64,
                        "counter unit busy, retrying"
                    );
                    self.backoff.sleep(self.policy.backoff);
                }
                BeginStatus::Busy => {}
            }
        }
        warn!(attempts = max_attempts, "counter unit busy, retry budget exhausted");
        Err(ProbeError::CounterUnitBusy {
            attempts: max_attempts,
        })
    }

    fn release(&mut self) {
        self.held = false;
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

// ── Explicit lock strategy ──────────────────────────────────────────────

/// Device-level profiling lock.
pub trait ProfilingLockDevice {
    /// `None` waits indefinitely.
    fn acquire_profiling_lock(&mut self, timeout: Option<Duration>) -> Result<()>;

    fn release_profiling_lock(&mut self);
}

pub struct ExplicitLock<D: ProfilingLockDevice> {
    device: D,
    timeout: Option<Duration>,
    held: bool,
}

impl<D: ProfilingLockDevice> ExplicitLock<D> {
    pub fn new(device: D, timeout: Option<Duration>) -> Self {
        Self {
            device,
            timeout,
            held: false,
        }
    }
}

impl<D: ProfilingLockDevice> CounterUnitLock for ExplicitLock<D> {
    fn acquire(&mut self) -> Result<()> {
        if self.held {
            return Ok(());
        }
        debug!(timeout = ?self.timeout, "acquiring profiling lock");
        self.device.acquire_profiling_lock(self.timeout)?;
        self.held = true;
        Ok(())
    }

    fn begin(&mut self, attempt: &mut dyn FnMut() -> Result<BeginStatus>) -> Result<()> {
        if !self.held {
            return Err(ProbeError::ProfilingLock(
                "query begin attempted without holding the profiling lock".into(),
            ));
        }
        match attempt()? {
            BeginStatus::Started => Ok(()),
            BeginStatus::Busy => Err(ProbeError::ProfilingLock(
                "counter unit reported busy while the profiling lock is held".into(),
            )),
        }
    }

    fn release(&mut self) {
        if self.held {
            self.device.release_profiling_lock();
            self.held = false;
            debug!("released profiling lock");
        }
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl<D: ProfilingLockDevice> Drop for ExplicitLock<D> {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Guard ───────────────────────────────────────────────────────────────

/// Holds a [`CounterUnitLock`] until dropped.
pub struct LockGuard<'a, L: CounterUnitLock + ?Sized> {
    lock: &'a mut L,
}

impl<'a, L: CounterUnitLock + ?Sized> LockGuard<'a, L> {
    pub fn acquire(lock: &'a mut L) -> Result<Self> {
        lock.acquire()?;
        Ok(Self { lock })
    }

    pub fn lock(&mut self) -> &mut L {
        self.lock
    }
}

impl<L: CounterUnitLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::simulated::RecordingBackoff;

    fn busy_then_started(busy: u32) -> impl FnMut() -> Result<BeginStatus> {
        let mut calls = 0;
        move || {
            calls += 1;
            if calls <= busy {
                Ok(BeginStatus::Busy)
            } else {
                Ok(BeginStatus::Started)
            }
        }
    }

    #[test]
    fn retries_three_busy_begins_then_proceeds() {
        let mut lock = RetryBeginLock::new(RetryPolicy::default(), RecordingBackoff::default());
        let mut attempt = busy_then_started(3);
        lock.begin(&mut attempt).expect("begin succeeds on fourth attempt");
        assert_eq!(
            lock.backoff().sleeps(),
            vec![Duration::from_millis(10); 3],
            "one backoff per busy attempt"
        );
    }

    #[test]
    fn budget_exhaustion_is_contention_error() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(5),
        };
        let mut lock = RetryBeginLock::new(policy, RecordingBackoff::default());
        let mut attempt = busy_then_started(u32::MAX);
        let err = lock.begin(&mut attempt).expect_err("budget exhausted");
        assert!(matches!(err, ProbeError::CounterUnitBusy { attempts: 4 }));
        // No sleep after the final attempt.
        assert_eq!(lock.backoff().sleeps().len(), 3);
    }

    #[test]
    fn driver_errors_are_not_retried() {
        let mut lock = RetryBeginLock::new(RetryPolicy::default(), RecordingBackoff::default());
        let mut calls = 0;
        let mut attempt = || -> Result<BeginStatus> {
            calls += 1;
            Err(ProbeError::Driver {
                call: "begin",
                detail: "lost device".into(),
            })
        };
        lock.begin(&mut attempt).expect_err("driver error propagates");
        assert_eq!(calls, 1);
        assert!(lock.backoff().sleeps().is_empty());
    }

    #[derive(Clone, Default)]
    struct LockDevice {
        acquired: Rc<Cell<u32>>,
        released: Rc<Cell<u32>>,
        fail: bool,
    }

    impl ProfilingLockDevice for LockDevice {
        fn acquire_profiling_lock(&mut self, _timeout: Option<Duration>) -> Result<()> {
            if self.fail {
                return Err(ProbeError::ProfilingLock("timeout".into()));
            }
            self.acquired.set(self.acquired.get() + 1);
            Ok(())
        }

        fn release_profiling_lock(&mut self) {
            self.released.set(self.released.get() + 1);
        }
    }

    #[test]
    fn guard_releases_explicit_lock_on_error_path() {
        let device = LockDevice::default();
        let mut lock = ExplicitLock::new(device.clone(), None);
        let outcome = (|| -> Result<()> {
            let mut guard = LockGuard::acquire(&mut lock)?;
            guard.lock().begin(&mut || Ok(BeginStatus::Started))?;
            Err(ProbeError::Submission("rejected".into()))
        })();
        assert!(outcome.is_err());
        assert!(!lock.is_held());
        assert_eq!(device.acquired.get(), 1);
        assert_eq!(device.released.get(), 1);
        drop(lock);
        assert_eq!(device.released.get(), 1, "no double release on drop");
    }

    #[test]
    fn busy_under_explicit_lock_is_an_error() {
        let mut lock = ExplicitLock::new(LockDevice::default(), Some(Duration::from_secs(1)));
        lock.acquire().expect("acquire");
        let err = lock
            .begin(&mut || Ok(BeginStatus::Busy))
            .expect_err("busy while held");
        assert!(matches!(err, ProbeError::ProfilingLock(_)));
    }

    #[test]
    fn explicit_lock_requires_acquire_before_begin() {
        let mut lock = ExplicitLock::new(LockDevice::default(), None);
        let err = lock
            .begin(&mut || Ok(BeginStatus::Started))
            .expect_err("not held");
        assert!(matches!(err, ProbeError::ProfilingLock(_)));
    }

    #[test]
    fn failed_acquire_leaves_lock_released() {
        let device = LockDevice {
            fail: true,
            ..LockDevice::default()
        };
        let mut lock = ExplicitLock::new(device.clone(), None);
        assert!(LockGuard::acquire(&mut lock).is_err());
        assert!(!lock.is_held());
        assert_eq!(device.released.get(), 0);
    }
}
