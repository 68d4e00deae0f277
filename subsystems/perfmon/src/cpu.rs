//! # Per-Processor Slots
//!
//! Each processor has one slot, created with the service and passed
//! explicitly to the scheduler hooks and the interrupt path.
//!
//! ```text
//!  CpuSlot
//!  ├── owner       context whose state lives in this CPU's PMU
//!  ├── activation  token bumped each time a context is (re)installed
//!  ├── timer       switch timer for timeout-driven multiplexing
//!  └── stats       interrupt-path and hook counters
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::context::Context;
use crate::timer::SwitchTimer;
use crate::CpuId;

// =============================================================================
// STATISTICS
// =============================================================================

/// Per-processor counters
#[derive(Debug, Default)]
pub struct CpuStats {
    /// Overflow interrupts taken
    pub interrupts: AtomicU64,
    /// Interrupts discarded as spurious
    pub spurious: AtomicU64,
    /// Hardware freeze failures
    pub freeze_failures: AtomicU64,
    /// Overflow interrupts replayed after a reload
    pub replays: AtomicU64,
    /// Confirmed 64-bit overflows
    pub overflows: AtomicU64,
    /// Event set switches
    pub set_switches: AtomicU64,
    /// Context switches that touched a monitored context
    pub ctxsw: AtomicU64,
    /// Deferred work items handled
    pub work_items: AtomicU64,
    /// Notifications sent
    pub notifications: AtomicU64,
}

/// Point-in-time copy of [`CpuStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    /// Overflow interrupts taken
    pub interrupts: u64,
    /// Interrupts discarded as spurious
    pub spurious: u64,
    /// Hardware freeze failures
    pub freeze_failures: u64,
    /// Overflow interrupts replayed after a reload
    pub replays: u64,
    /// Confirmed 64-bit overflows
    pub overflows: u64,
    /// Event set switches
    pub set_switches: u64,
    /// Context switches that touched a monitored context
    pub ctxsw: u64,
    /// Deferred work items handled
    pub work_items: u64,
    /// Notifications sent
    pub notifications: u64,
}

impl CpuStats {
    /// Add one to a counter
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> CpuStatsSnapshot {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CpuStatsSnapshot {
            interrupts: ld(&self.interrupts),
            spurious: ld(&self.spurious),
            freeze_failures: ld(&self.freeze_failures),
            replays: ld(&self.replays),
            overflows: ld(&self.overflows),
            set_switches: ld(&self.set_switches),
            ctxsw: ld(&self.ctxsw),
            work_items: ld(&self.work_items),
            notifications: ld(&self.notifications),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for c in [
            &self.interrupts,
            &self.spurious,
            &self.freeze_failures,
            &self.replays,
            &self.overflows,
            &self.set_switches,
            &self.ctxsw,
            &self.work_items,
            &self.notifications,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// SLOT
// =============================================================================

/// State of one processor
#[derive(Debug)]
pub struct CpuSlot {
    /// Processor index
    pub id: CpuId,
    owner: Mutex<Option<Arc<Context>>>,
    activation: AtomicU64,
    /// Switch timer of this processor
    pub timer: SwitchTimer,
    /// Counters
    pub stats: CpuStats,
}

impl CpuSlot {
    /// Empty slot
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            owner: Mutex::new(None),
            activation: AtomicU64::new(0),
            timer: SwitchTimer::new(),
            stats: CpuStats::default(),
        }
    }

    /// Context currently owning the PMU of this processor
    pub fn owner(&self) -> Option<Arc<Context>> {
        self.owner.lock().clone()
    }

    /// True if `ctx` owns this processor
    pub fn is_owner(&self, ctx: &Context) -> bool {
        self.owner
            .lock()
            .as_ref()
            .is_some_and(|c| core::ptr::eq(c.as_ref(), ctx))
    }

    /// Install `ctx` as owner and return its fresh activation token
    pub fn install(&self, ctx: Arc<Context>) -> u64 {
        *self.owner.lock() = Some(ctx);
        self.activation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clear ownership if held by `ctx`
    pub fn uninstall(&self, ctx: &Context) {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|c| core::ptr::eq(c.as_ref(), ctx)) {
            *owner = None;
        }
    }

    /// Current activation token
    pub fn activation(&self) -> u64 {
        self.activation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_and_reset() {
        let slot = CpuSlot::new(CpuId(0));
        CpuStats::inc(&slot.stats.interrupts);
        CpuStats::inc(&slot.stats.interrupts);
        CpuStats::inc(&slot.stats.spurious);
        let snap = slot.stats.snapshot();
        assert_eq!(snap.interrupts, 2);
        assert_eq!(snap.spurious, 1);
        slot.stats.reset();
        assert_eq!(slot.stats.snapshot(), CpuStatsSnapshot::default());
    }

    #[test]
    fn test_empty_slot() {
        let slot = CpuSlot::new(CpuId(3));
        assert!(slot.owner().is_none());
        assert_eq!(slot.activation(), 0);
    }
}
