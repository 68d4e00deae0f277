//! # Host Kernel Collaborators
//!
//! What perfmon needs from the rest of the kernel besides the PMU itself:
//! a monotonic clock, a few facts about threads, the stop/trace facility
//! used by the stopped-peer rule, local interrupt masking, and a way to
//! wait.
//!
//! The context lock is shared with the overflow interrupt, so every
//! acquisition outside interrupt context goes through [`lock_irqsave`].

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::{ErrorKind, PfmError, PfmResult};
use crate::ThreadId;

/// Services provided by the host kernel
pub trait Platform: Send + Sync {
    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Thread runs only in kernel mode
    fn is_kernel_thread(&self, thread: ThreadId) -> bool;

    /// Thread is exiting or already dead
    fn is_exiting(&self, thread: ThreadId) -> bool;

    /// Thread is held stopped by the stop/trace facility
    fn is_stopped(&self, thread: ThreadId) -> bool;

    /// Block until a stopped thread is fully off-processor
    ///
    /// Called before any context lock is taken.
    fn wait_inactive(&self, _thread: ThreadId) -> PfmResult<()> {
        Ok(())
    }

    /// A signal is pending for the waiting thread
    fn signal_pending(&self, _thread: ThreadId) -> bool {
        false
    }

    /// Yield while polling a wait condition
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Disable local interrupts; returns whether they were enabled
    fn disable_interrupts(&self) -> bool;

    /// Re-enable local interrupts if `was_enabled`
    fn restore_interrupts(&self, was_enabled: bool);
}

// =============================================================================
// INTERRUPT MASKING
// =============================================================================

/// Local interrupts withheld until dropped; restores the previous state
#[must_use]
pub struct IrqSave<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> IrqSave<'a> {
    /// Disable local interrupts
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.disable_interrupts();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl Drop for IrqSave<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.was_enabled);
    }
}

impl core::fmt::Debug for IrqSave<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqSave")
            .field("was_enabled", &self.was_enabled)
            .finish()
    }
}

/// Execute a closure with local interrupts disabled
#[inline]
pub fn without_interrupts<R>(platform: &dyn Platform, f: impl FnOnce() -> R) -> R {
    let _irq = IrqSave::new(platform);
    f()
}

/// Mutex guard taken with local interrupts disabled
///
/// Field order matters: the lock is released before interrupts are
/// restored.
#[must_use]
pub struct IrqGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _irq: IrqSave<'a>,
}

/// Lock `mutex` with local interrupts disabled
pub fn lock_irqsave<'a, T>(platform: &'a dyn Platform, mutex: &'a Mutex<T>) -> IrqGuard<'a, T> {
    let irq = IrqSave::new(platform);
    IrqGuard {
        guard: mutex.lock(),
        _irq: irq,
    }
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IrqGuard<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&*self.guard, f)
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

/// Counting completion: `complete` from any context, `wait` from thread
/// context only
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicU32,
}

impl Completion {
    /// New, not completed
    pub const fn new() -> Self {
        Self {
            done: AtomicU32::new(0),
        }
    }

    /// Signal one waiter. Safe from interrupt context.
    pub fn complete(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
    }

    /// Consume one completion if available
    pub fn try_wait(&self) -> bool {
        self.done
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Drop every pending completion
    pub fn reinit(&self) {
        self.done.store(0, Ordering::Release);
    }

    /// Wait for a completion on behalf of `thread`; aborts with
    /// `Interrupted` when a signal becomes pending
    pub fn wait(&self, platform: &dyn Platform, thread: ThreadId) -> PfmResult<()> {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            if platform.signal_pending(thread) {
                return Err(PfmError::new(ErrorKind::Interrupted, "wait interrupted"));
            }
            platform.relax();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;

    #[test]
    fn test_completion_counts() {
        let c = Completion::new();
        assert!(!c.try_wait());
        c.complete();
        c.complete();
        assert!(c.try_wait());
        assert!(c.try_wait());
        assert!(!c.try_wait());
    }

    #[test]
    fn test_wait_interrupted_by_signal() {
        let platform = TestPlatform::new();
        let t = ThreadId(9);
        platform.raise_signal(t);
        let c = Completion::new();
        let err = c.wait(&platform, t).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }

    #[test]
    fn test_irqsave_restores_previous_state() {
        let platform = TestPlatform::new();
        let m = Mutex::new(5u32);
        assert!(platform.irqs_enabled());
        {
            let mut g = lock_irqsave(&platform, &m);
            *g += 1;
            assert!(!platform.irqs_enabled());
            without_interrupts(&platform, || assert!(!platform.irqs_enabled()));
            // nested section must not re-enable
            assert!(!platform.irqs_enabled());
            assert!(m.try_lock().is_none());
        }
        assert!(platform.irqs_enabled());
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn test_wait_across_threads() {
        let platform = std::sync::Arc::new(TestPlatform::new());
        let c = std::sync::Arc::new(Completion::new());
        let (p2, c2) = (platform.clone(), c.clone());
        let waiter = std::thread::spawn(move || c2.wait(p2.as_ref(), ThreadId(1)));
        c.complete();
        assert!(waiter.join().unwrap().is_ok());
    }
}
