use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{GpuError, Result};

/// A point on the queue's completion timeline.
///
/// `FenceValue::ZERO` stands for "no work" and is always reached.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic completion counter for one queue.
///
/// Two counters move independently:
/// - `issued`: last value reserved by [`signal_next`](Self::signal_next)
/// - `completed`: last value the backend reported finished
///
/// `completed <= issued` always holds. Waiters park on a condition variable that
/// [`complete`](Self::complete) notifies.
#[derive(Debug, Default)]
pub struct Fence {
    issued: AtomicU64,
    completed: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the value the next submission will signal.
    ///
    /// Reserved values must reach the queue in reservation order, so only the
    /// device reserves them, under its submit lock.
    #[inline]
    pub(crate) fn signal_next(&self) -> FenceValue {
        FenceValue(self.issued.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Returns `value` to the timeline if it is still the latest reservation.
    ///
    /// Used when the queue rejected a submission before enqueuing anything.
    pub(crate) fn cancel(&self, value: FenceValue) -> bool {
        self.issued
            .compare_exchange(value.0, value.0 - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Last value handed out by [`signal_next`](Self::signal_next).
    #[inline]
    pub fn last_issued(&self) -> FenceValue {
        FenceValue(self.issued.load(Ordering::Acquire))
    }

    /// Last value the queue reported as finished.
    #[inline]
    pub fn completed_value(&self) -> FenceValue {
        FenceValue(self.completed.load(Ordering::Acquire))
    }

    /// Returns whether all work up to `value` has finished.
    pub fn reached(&self, value: FenceValue) -> Result<bool> {
        self.check_issued(value)?;
        Ok(self.completed_value() >= value)
    }

    /// Blocks until `value` is reached.
    pub fn wait_until(&self, value: FenceValue) -> Result<()> {
        self.check_issued(value)?;

        if self.completed_value() >= value {
            return Ok(());
        }

        let mut guard = self.lock.lock();
        while self.completed_value() < value {
            self.cond.wait(&mut guard);
        }
        Ok(())
    }

    /// Blocks until `value` is reached or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, value: FenceValue, timeout: Duration) -> Result<bool> {
        self.check_issued(value)?;

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.completed_value() < value {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return Ok(self.completed_value() >= value);
            }
        }
        Ok(true)
    }

    /// Records that the queue finished the work signalled with `value`.
    ///
    /// Called by backends. Completion never moves backwards, so late or
    /// duplicated notifications are harmless.
    pub fn complete(&self, value: FenceValue) {
        debug_assert!(
            value <= self.last_issued(),
            "completed fence value {value} that was never issued"
        );

        // Taking the lock orders the store against a waiter that has checked the
        // counter but not yet parked.
        let _guard = self.lock.lock();
        self.completed.fetch_max(value.0, Ordering::AcqRel);
        self.cond.notify_all();
    }

    fn check_issued(&self, value: FenceValue) -> Result<()> {
        let last_issued = self.last_issued();
        if value > last_issued {
            return Err(GpuError::FenceNotIssued { value, last_issued });
        }
        Ok(())
    }
}
