//! # Monitoring Context
//!
//! One monitoring session, per-thread or system-wide.
//!
//! ```text
//!             load                    interrupt (mask)
//!  Detached ────────▶ Attached ─────────────────────────▶ Suspended
//!     ▲                │   ▲                                  │
//!     │     unload     │   └──────────── restart ─────────────┘
//!     ├────────────────┘                                      │
//!     │                                                       │
//!     │   teardown by the     unload/close of a running peer  │
//!     └──────────────────── Defunct ◀─────────────────────────┘
//!        monitored thread             (from Attached too)
//! ```
//!
//! All mutable state lives in [`ContextInner`] behind one `spin::Mutex`,
//! shared with the overflow interrupt. Outside interrupt context it is
//! only taken through [`Context::lock`], which withholds local
//! interrupts for as long as the guard lives. Operations that would block (timer cancellation, waking waiters,
//! posting work to another thread) are collected in a [`Deferred`] while
//! the lock is held and executed by the caller once it is dropped.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::arbiter::RegView;
use crate::backend::PmuBackend;
use crate::bitmap::{CpuMask, RegMask};
use crate::cpu::{CpuSlot, CpuStats};
use crate::format::{OvflCtrl, SamplingFormat};
use crate::msg::MessageQueue;
use crate::platform::{lock_irqsave, Completion, IrqGuard, Platform};
use crate::regs::{PmuDescription, RegFlags};
use crate::sched::{PfmThread, WorkFlags};
use crate::set::{EventSet, SetFlags, SetList};
use crate::{ContextId, CpuId, SetId, ThreadId};

// =============================================================================
// FLAGS AND STATE
// =============================================================================

bitflags! {
    /// Context creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CtxFlags: u32 {
        /// System-wide session bound to one processor
        const SYSTEM = 1 << 0;
        /// Monitored thread blocks on notification until restart
        const BLOCK = 1 << 1;
        /// Do not queue overflow messages
        const NO_MSG = 1 << 2;
        /// System-wide: stop counting while the idle thread runs
        const EXCL_IDLE = 1 << 3;
    }
}

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Not bound to any thread or processor
    Detached,
    /// Bound and live
    Attached,
    /// Bound, monitoring masked until restart
    Suspended,
    /// Closed while bound to a running thread; awaiting its teardown
    Defunct,
}

impl ContextState {
    /// Bound to a target (Attached or Suspended)
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Attached | Self::Suspended)
    }
}

/// What a context is attached to
#[derive(Debug, Clone)]
pub enum Binding {
    /// Per-thread session
    Thread(Arc<PfmThread>),
    /// System-wide session
    Cpu(CpuId),
}

impl Binding {
    /// Monitored thread
    pub fn thread(&self) -> Option<&Arc<PfmThread>> {
        match self {
            Self::Thread(t) => Some(t),
            Self::Cpu(_) => None,
        }
    }
}

// =============================================================================
// DEFERRED ACTIONS
// =============================================================================

/// Work that must run after the context lock is released
#[derive(Debug)]
pub(crate) enum DeferredAction {
    /// Wait for the switch timer handler of a processor
    CancelTimer(CpuId),
    /// Wake message readers
    WakeReaders,
    /// Release a thread blocked on notification
    WakeBlocked,
    /// Post work to a thread
    PostWork(Arc<PfmThread>, WorkFlags),
}

/// Actions collected under the context lock
///
/// Every action is idempotent or mergeable, so collecting never fails:
/// timer cancellations form a processor set and posted work folds into
/// one flag word for the monitored thread.
#[must_use]
#[derive(Debug, Default)]
pub struct Deferred {
    cancel_timers: CpuMask,
    wake_readers: bool,
    wake_blocked: bool,
    work: Option<(Arc<PfmThread>, WorkFlags)>,
}

impl Deferred {
    /// Nothing to do
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, action: DeferredAction) {
        match action {
            DeferredAction::CancelTimer(cpu) => self.cancel_timers.set(cpu.0),
            DeferredAction::WakeReaders => self.wake_readers = true,
            DeferredAction::WakeBlocked => self.wake_blocked = true,
            DeferredAction::PostWork(thread, flags) => match self.work.as_mut() {
                Some((t, pending)) if t.id() == thread.id() => *pending |= flags,
                Some((t, pending)) => {
                    // posting is a single atomic; hand over the previous word
                    t.post_work(*pending);
                    *t = thread;
                    *pending = flags;
                },
                None => self.work = Some((thread, flags)),
            },
        }
    }

    /// True if no action is pending
    pub fn is_empty(&self) -> bool {
        self.cancel_timers.is_empty() && !self.wake_readers && !self.wake_blocked && self.work.is_none()
    }

    /// Execute every action. Must be called without the context lock.
    pub fn run(self, ctx: &Context, cpus: &[CpuSlot]) {
        for cpu in self.cancel_timers.iter() {
            if let Some(slot) = cpus.get(cpu) {
                slot.timer.cancel();
            }
        }
        if self.wake_readers {
            ctx.msg_ready.complete();
        }
        if self.wake_blocked {
            ctx.restart_done.complete();
        }
        if let Some((thread, flags)) = self.work {
            thread.post_work(flags);
        }
    }
}

// =============================================================================
// HARDWARE ENVIRONMENT
// =============================================================================

/// Everything a locked operation needs to reach the hardware
#[derive(Clone, Copy)]
pub(crate) struct Hw<'a> {
    pub backend: &'a dyn PmuBackend,
    pub desc: &'a PmuDescription,
    pub cpus: &'a [CpuSlot],
    pub now: u64,
}

impl Hw<'_> {
    pub fn slot(&self, cpu: CpuId) -> &CpuSlot {
        &self.cpus[cpu.0]
    }

    /// Data register physically backed by the PMU
    pub fn is_hw_pmd(&self, index: usize) -> bool {
        self.desc
            .pmd(index)
            .is_some_and(|r| r.kind.soft().is_none() && !r.flags.contains(RegFlags::VIRTUAL))
    }

    /// Hardware image of a 64-bit value
    pub fn to_hw(&self, index: usize, value: u64) -> u64 {
        if self.desc.emulates_64bit(index) {
            value & self.desc.ovfl_mask()
        } else {
            value
        }
    }

    /// Merge a hardware read into a 64-bit shadow value
    pub fn merge(&self, index: usize, shadow: u64, hw: u64) -> u64 {
        if self.desc.emulates_64bit(index) {
            let mask = self.desc.ovfl_mask();
            (shadow & !mask) | (hw & mask)
        } else {
            hw
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Mutable context state, guarded by [`Context::inner`]
pub struct ContextInner {
    /// Lifecycle state
    pub state: ContextState,
    /// Attachment
    pub binding: Option<Binding>,
    /// Event sets
    pub sets: SetList,
    /// Monitoring requested by start
    pub started: bool,
    /// Processor whose PMU currently holds the live state
    pub loaded_cpu: Option<CpuId>,
    /// Processor and token of the last install, for lazy reload
    pub last_cpu: Option<CpuId>,
    /// Activation token of the last install; 0 forces a reload
    pub last_act: u64,
    /// Counting paused because the idle thread runs
    pub idle_paused: bool,
    /// Restart credits (one per notification)
    pub credits: u32,
    /// Set switch deferred by masking
    pub switch_pending: bool,
    /// Set that was active at the last unload
    pub last_set: Option<SetId>,
    /// Registers usable while attached
    pub view: RegView,
    /// Pending notifications
    pub msgs: MessageQueue,
    /// Sampling format
    pub format: Option<Box<dyn SamplingFormat>>,
    /// Handle closed; free after teardown
    pub closed: bool,
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInner")
            .field("state", &self.state)
            .field("sets", &self.sets.len())
            .field("active", &self.sets.active().id)
            .field("started", &self.started)
            .field("loaded_cpu", &self.loaded_cpu)
            .field("credits", &self.credits)
            .field("format", &self.format.as_ref().map(|format| format.name()))
            .finish()
    }
}

/// A monitoring context
pub struct Context {
    id: ContextId,
    flags: CtxFlags,
    pub(crate) backend: Arc<dyn PmuBackend>,
    pub(crate) desc: Arc<PmuDescription>,
    platform: Arc<dyn Platform>,
    /// Taken directly only from interrupt context
    pub(crate) inner: Mutex<ContextInner>,
    /// Signalled by restart for a thread blocked on notification
    pub(crate) restart_done: Completion,
    /// Signalled for each queued message
    pub(crate) msg_ready: Completion,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        flags: CtxFlags,
        backend: Arc<dyn PmuBackend>,
        desc: Arc<PmuDescription>,
        platform: Arc<dyn Platform>,
        first: EventSet,
        format: Option<Box<dyn SamplingFormat>>,
    ) -> crate::error::PfmResult<Self> {
        let mut sets = SetList::new();
        sets.insert(first)?;
        Ok(Self {
            id,
            flags,
            backend,
            desc,
            platform,
            inner: Mutex::new(ContextInner {
                state: ContextState::Detached,
                binding: None,
                sets,
                started: false,
                loaded_cpu: None,
                last_cpu: None,
                last_act: 0,
                idle_paused: false,
                credits: 0,
                switch_pending: false,
                last_set: None,
                view: RegView::default(),
                msgs: MessageQueue::new(),
                format,
                closed: false,
            }),
            restart_done: Completion::new(),
            msg_ready: Completion::new(),
        })
    }

    /// Context identifier
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Creation flags
    pub fn flags(&self) -> CtxFlags {
        self.flags
    }

    /// System-wide context
    pub fn is_system(&self) -> bool {
        self.flags.contains(CtxFlags::SYSTEM)
    }

    /// Current state
    pub fn state(&self) -> ContextState {
        self.lock().state
    }

    /// Messages lost to a full queue
    pub fn dropped_messages(&self) -> u64 {
        self.lock().msgs.dropped()
    }

    /// Active set id
    pub fn active_set(&self) -> SetId {
        self.lock().sets.active().id
    }

    /// Lock the context from thread context, local interrupts withheld
    pub(crate) fn lock(&self) -> IrqGuard<'_, ContextInner> {
        lock_irqsave(self.platform.as_ref(), &self.inner)
    }

    pub(crate) fn hw<'a>(&'a self, cpus: &'a [CpuSlot], now: u64) -> Hw<'a> {
        Hw {
            backend: self.backend.as_ref(),
            desc: self.desc.as_ref(),
            cpus,
            now,
        }
    }
}

// =============================================================================
// HARDWARE HELPERS
// =============================================================================

impl ContextInner {
    /// Hardware is counting for this context
    pub fn is_counting(&self) -> bool {
        self.state == ContextState::Attached
            && self.started
            && self.loaded_cpu.is_some()
            && !self.idle_paused
    }

    /// Monitored thread id, if per-thread
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.binding
            .as_ref()
            .and_then(Binding::thread)
            .map(|t| t.id())
    }

    /// Hardware no longer mirrors the shadow state
    pub fn invalidate_lazy(&mut self) {
        if self.loaded_cpu.is_none() {
            self.last_act = 0;
        }
    }

    /// Program the active set into `cpu`
    pub(crate) fn load_regs(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        let set = self.sets.active();
        for i in self.view.pmcs.iter() {
            hw.backend.write_pmc(cpu, i, set.pmcs[i]);
        }
        for i in self.view.pmds.iter() {
            if !hw.is_hw_pmd(i) || hw.desc.pmds[i].flags.contains(RegFlags::RO) {
                continue;
            }
            hw.backend.write_pmd(cpu, i, hw.to_hw(i, set.pmds[i].value));
        }
        hw.backend.serialize(cpu);
    }

    /// Fold live hardware values of `cpu` into the active set
    pub(crate) fn fold(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        let set = self.sets.active_mut();
        for i in set.used_pmds.iter() {
            if !hw.is_hw_pmd(i) {
                continue;
            }
            let raw = hw.backend.read_pmd(cpu, i);
            let pmd = &mut set.pmds[i];
            pmd.value = hw.merge(i, pmd.value, raw);
        }
    }

    /// Stop counting on `cpu`, fold values, close the duration window and
    /// disarm the switch timer
    pub(crate) fn pause(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        let latched = hw.backend.stop(cpu);
        let set = self.sets.active_mut();
        let latched = latched.intersect(&set.used_pmds);
        set.pending_ovfl.union_with(&latched);
        self.fold(hw, cpu);
        self.sets.active_mut().close_window(hw.now);
        self.disarm_timer(hw, cpu);
    }

    /// Resume counting on `cpu`
    pub(crate) fn resume(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        hw.backend.start(cpu);
        self.sets.active_mut().open_window(hw.now);
        self.arm_timer(hw, cpu);
    }

    /// Arm the switch timer of `cpu` for the active set's remaining slice
    pub(crate) fn arm_timer(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        let set = self.sets.active_mut();
        if !set.flags.contains(SetFlags::SWITCH_TIMEOUT) {
            return;
        }
        let slice = if set.remaining_ns > 0 {
            set.remaining_ns
        } else {
            set.timeout_ns
        };
        set.remaining_ns = slice;
        hw.slot(cpu).timer.arm(hw.now.saturating_add(slice));
    }

    /// Disarm the switch timer of `cpu`, keeping the unused slice
    pub(crate) fn disarm_timer(&mut self, hw: &Hw<'_>, cpu: CpuId) {
        if let Some(deadline) = hw.slot(cpu).timer.disarm() {
            let set = self.sets.active_mut();
            if set.flags.contains(SetFlags::SWITCH_TIMEOUT) {
                set.remaining_ns = deadline.saturating_sub(hw.now).max(1);
            }
        }
    }

    /// Make `cpu` hold this context's state. With `lazy`, the reload is
    /// skipped when the processor still holds it from the last install.
    pub(crate) fn install(&mut self, ctx: &Arc<Context>, hw: &Hw<'_>, cpu: CpuId, lazy: bool) {
        let slot = hw.slot(cpu);
        let valid = lazy
            && self.last_act != 0
            && self.last_cpu == Some(cpu)
            && self.last_act == slot.activation()
            && slot.is_owner(ctx);
        if !valid {
            self.load_regs(hw, cpu);
            self.last_act = slot.install(ctx.clone());
            self.last_cpu = Some(cpu);
        }
        self.loaded_cpu = Some(cpu);
        if !self.sets.active().pending_ovfl.is_empty() {
            hw.backend.resend_interrupt(cpu);
            CpuStats::inc(&slot.stats.replays);
        }
    }

    /// Release the hardware: stop, fold, drop processor ownership
    pub(crate) fn detach_hw(&mut self, ctx: &Context, hw: &Hw<'_>, deferred: &mut Deferred) {
        if let Some(cpu) = self.loaded_cpu.take() {
            self.pause(hw, cpu);
            hw.slot(cpu).uninstall(ctx);
            deferred.push(DeferredAction::CancelTimer(cpu));
        }
        if let Some(cpu) = self.last_cpu.take() {
            hw.slot(cpu).uninstall(ctx);
        }
        self.last_act = 0;
        self.idle_paused = false;
    }

    /// Reset `mask` registers of the set at `pos`; `long` selects the
    /// restart value instead of the interrupt-time value
    pub(crate) fn apply_resets(&mut self, hw: &Hw<'_>, pos: usize, mask: &RegMask, long: bool) {
        let live = if pos == self.sets.active_pos() {
            self.loaded_cpu
        } else {
            None
        };
        let set = self.sets.at_mut(pos);
        for i in mask.intersect(&set.used_pmds).iter() {
            let value = set.apply_reset(i, long);
            set.pending_ovfl.clear(i);
            if let Some(cpu) = live {
                if hw.is_hw_pmd(i) {
                    hw.backend.write_pmd(cpu, i, hw.to_hw(i, value));
                }
            }
        }
        if live.is_none() {
            self.invalidate_lazy();
        }
    }

    /// Acknowledge notifications: apply deferred resets, perform a
    /// deferred switch and unmask
    pub(crate) fn apply_restart(&mut self, hw: &Hw<'_>) {
        let attached = self.state.is_bound();
        let ctrl = match self.format.as_mut() {
            Some(format) => format.restart(attached),
            None => OvflCtrl::RESET,
        };
        let pos = self.sets.active_pos();
        let pending = core::mem::take(&mut self.sets.active_mut().reset_pending);
        if ctrl.contains(OvflCtrl::RESET) {
            self.apply_resets(hw, pos, &pending, true);
        }
        if self.switch_pending {
            self.switch_pending = false;
            crate::switch::switch_sets(self, hw, None);
        }
        if self.state == ContextState::Suspended {
            self.state = ContextState::Attached;
            if let Some(cpu) = self.loaded_cpu {
                if self.is_counting() {
                    self.resume(hw, cpu);
                }
            }
        }
    }

    /// Let go of the sampling format
    pub(crate) fn release_format(&mut self) {
        if let Some(mut format) = self.format.take() {
            format.exit();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn test_new_context_is_detached_with_set_zero() {
        let fx = Fixture::new(1, 4, 32);
        let h = fx.create(CtxFlags::empty());
        assert_eq!(h.state(), ContextState::Detached);
        assert_eq!(h.active_set(), 0);
    }

    #[test]
    fn test_hw_merge_keeps_upper_bits() {
        let fx = Fixture::new(1, 1, 8);
        let desc = fx.pfm.pmu_description().unwrap();
        let hw = Hw {
            backend: fx.pmu.as_ref(),
            desc: desc.as_ref(),
            cpus: &[],
            now: 0,
        };
        assert_eq!(hw.merge(0, 0x1234_5600, 0x1FF), 0x1234_56FF);
        assert_eq!(hw.to_hw(0, 0x1234_56AB), 0xAB);
    }

    #[test]
    fn test_deferred_wakes() {
        let fx = Fixture::new(1, 1, 32);
        let h = fx.create(CtxFlags::empty());
        let mut d = Deferred::new();
        d.push(DeferredAction::WakeReaders);
        d.push(DeferredAction::WakeBlocked);
        assert!(!d.is_empty());
        d.run(h.context(), fx.pfm.cpus());
        assert!(h.context().msg_ready.try_wait());
        assert!(h.context().restart_done.try_wait());
    }

    #[test]
    fn test_deferred_never_drops_actions() {
        let fx = Fixture::new(2, 1, 32);
        let h = fx.create(CtxFlags::BLOCK);
        let t = fx.thread(1);
        let mut d = Deferred::new();
        for _ in 0..32 {
            d.push(DeferredAction::CancelTimer(CpuId(0)));
            d.push(DeferredAction::CancelTimer(CpuId(1)));
            d.push(DeferredAction::WakeReaders);
            d.push(DeferredAction::PostWork(t.clone(), WorkFlags::RESET));
        }
        d.push(DeferredAction::PostWork(t.clone(), WorkFlags::BLOCK));
        d.push(DeferredAction::WakeBlocked);
        d.run(h.context(), fx.pfm.cpus());
        assert!(h.context().restart_done.try_wait());
        assert!(h.context().msg_ready.try_wait());
        // wakes coalesce into one completion
        assert!(!h.context().msg_ready.try_wait());
        assert_eq!(t.pending_work(), WorkFlags::RESET | WorkFlags::BLOCK);
    }
}
