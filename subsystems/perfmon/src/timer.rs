//! # Switch Timer
//!
//! One-shot per-processor timer driving timeout-based set switching.
//! Arming and disarming are lock-free and may be done with a context lock
//! held. [`SwitchTimer::cancel`] is the blocking half: it waits for a
//! running expiry handler and must only be called with no context lock
//! held.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Deadline value of a disarmed timer
const DISARMED: u64 = 0;

/// Per-processor switch timer
#[derive(Debug, Default)]
pub struct SwitchTimer {
    deadline: AtomicU64,
    running: AtomicBool,
}

impl SwitchTimer {
    /// Disarmed timer
    pub const fn new() -> Self {
        Self {
            deadline: AtomicU64::new(DISARMED),
            running: AtomicBool::new(false),
        }
    }

    /// Fire at absolute time `deadline` (ns)
    pub fn arm(&self, deadline: u64) {
        self.deadline.store(deadline.max(1), Ordering::Release);
    }

    /// Disarm without waiting; returns the deadline that was pending
    pub fn disarm(&self) -> Option<u64> {
        match self.deadline.swap(DISARMED, Ordering::AcqRel) {
            DISARMED => None,
            d => Some(d),
        }
    }

    /// Pending deadline
    pub fn deadline(&self) -> Option<u64> {
        match self.deadline.load(Ordering::Acquire) {
            DISARMED => None,
            d => Some(d),
        }
    }

    /// Claim an expiry at `now`. On success the caller runs the handler
    /// and then calls [`finish`](Self::finish).
    pub fn expire(&self, now: u64) -> bool {
        let d = self.deadline.load(Ordering::Acquire);
        if d == DISARMED || now < d {
            return false;
        }
        if self
            .deadline
            .compare_exchange(d, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.running.store(true, Ordering::Release);
        true
    }

    /// End of the expiry handler
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Expiry handler in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait for a running expiry handler to complete
    pub fn cancel(&self) {
        while self.running.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_once() {
        let t = SwitchTimer::new();
        t.arm(100);
        assert!(!t.expire(99));
        assert!(t.expire(100));
        assert!(t.is_running());
        assert!(!t.expire(200));
        t.finish();
        assert!(t.deadline().is_none());
    }

    #[test]
    fn test_disarm_reports_deadline() {
        let t = SwitchTimer::new();
        assert_eq!(t.disarm(), None);
        t.arm(42);
        assert_eq!(t.disarm(), Some(42));
        assert!(!t.expire(1000));
    }

    #[test]
    fn test_cancel_waits_for_handler() {
        let t = std::sync::Arc::new(SwitchTimer::new());
        t.arm(1);
        assert!(t.expire(1));
        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            t2.finish();
        });
        t.disarm();
        t.cancel();
        assert!(!t.is_running());
        h.join().unwrap();
    }
}
