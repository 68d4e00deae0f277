//! # Overflow Interrupt Path
//!
//! ```text
//!  interrupt ─▶ owner(cpu)? ─▶ lock ─▶ freeze ─▶ pending ∪ replayed
//!                  │ no                    │ fault           │ empty
//!                  ▼                       ▼                 ▼
//!               spurious               spurious          spurious
//!
//!  for each pending counter:
//!     shadow += 1 + ovfl_mask   (narrow counters)
//!     new < old ⇒ confirmed ─▶ reset list ∪= reset_pmds
//!                            ─▶ switch threshold -= 1
//!
//!  control = format(confirmed) | default policy
//!  MASK ─▶ SWITCH ─▶ NOTIFY ─▶ RESET ─▶ unfreeze (unless masked)
//! ```
//!
//! Runs with interrupts withheld and the context locked. Nothing here
//! blocks or allocates; failures are counted and logged, never returned.

use arrayvec::ArrayVec;

use crate::bitmap::RegMask;
use crate::context::{Binding, Context, ContextInner, ContextState, CtxFlags, Deferred, DeferredAction, Hw};
use crate::control::Perfmon;
use crate::cpu::CpuStats;
use crate::format::{OvflArg, OvflCtrl, MAX_SMPL_PMDS};
use crate::msg::Message;
use crate::regs::SoftRegAccess;
use crate::sched::WorkFlags;
use crate::set::{EventSet, PmdFlags, SetFlags};
use crate::switch::switch_sets;
use crate::CpuId;

/// Result of one overflow interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvflOutcome {
    /// Nothing to do; counted as spurious
    Spurious,
    /// Processed; `confirmed` counters overflowed 64 bits
    Handled {
        /// Number of confirmed overflows
        confirmed: usize,
        /// Monitoring was masked
        masked: bool,
    },
}

/// Interrupt-time facts
#[derive(Debug, Clone, Copy)]
pub(crate) struct OvflEvent {
    pub cpu: CpuId,
    pub ip: u64,
}

/// Current 64-bit value of data register `index` of `set`
pub(crate) fn current_value(hw: &Hw<'_>, set: &EventSet, index: usize, live: Option<CpuId>) -> u64 {
    let shadow = set.pmds[index].value;
    if let Some(soft) = hw.desc.pmd(index).and_then(|r| r.kind.soft()) {
        let access = SoftRegAccess {
            cpu: live.unwrap_or_default(),
            set: set.id,
            shadow,
        };
        return soft.read_soft(&access);
    }
    match live {
        Some(cpu) if hw.is_hw_pmd(index) => hw.merge(index, shadow, hw.backend.read_pmd(cpu, index)),
        _ => shadow,
    }
}

/// Process a frozen overflow on `ev.cpu`. The caller has checked that the
/// context is attached, counting and loaded on that processor.
pub(crate) fn overflow_handler(
    ctx: &Context,
    inner: &mut ContextInner,
    hw: &Hw<'_>,
    ev: OvflEvent,
    pending: RegMask,
    deferred: &mut Deferred,
) -> OvflOutcome {
    let cpu = ev.cpu;
    let slot = hw.slot(cpu);
    let pos = inner.sets.active_pos();
    let mask = hw.desc.ovfl_mask();

    let mut confirmed = RegMask::new();
    let mut reset = RegMask::new();
    let mut must_switch = false;
    {
        let set = inner.sets.active_mut();
        let mut pending = pending.union(&set.pending_ovfl);
        set.pending_ovfl.clear_all();
        pending = pending.intersect(&set.used_pmds).intersect(hw.desc.cnt_pmds());
        if pending.is_empty() {
            return OvflOutcome::Spurious;
        }

        for i in pending.iter() {
            let raw = hw.backend.read_pmd(cpu, i);
            let pmd = &mut set.pmds[i];
            let genuine = if hw.desc.emulates_64bit(i) {
                let old = (pmd.value & !mask) | (raw & mask);
                let new = old.wrapping_add(mask + 1);
                pmd.value = new;
                new < old
            } else {
                pmd.value = raw;
                true
            };
            #[cfg(feature = "debug_ovfl")]
            log::trace!("perfmon: pmd{} value={:#x} genuine={}", i, pmd.value, genuine);
            if !genuine {
                continue;
            }
            confirmed.set(i);
            reset.set(i);
            reset.union_with(&pmd.reset_pmds);
            if set.flags.contains(SetFlags::SWITCH_OVFL) && pmd.ovflsw_ref > 0 {
                pmd.ovflsw_thres = pmd.ovflsw_thres.saturating_sub(1);
                if pmd.ovflsw_thres == 0 {
                    must_switch = true;
                }
            }
        }
        set.ovfl_pmds = confirmed;
    }

    if confirmed.is_empty() {
        hw.backend.unfreeze(cpu);
        return OvflOutcome::Handled {
            confirmed: 0,
            masked: false,
        };
    }
    slot.stats
        .overflows
        .fetch_add(confirmed.count() as u64, core::sync::atomic::Ordering::Relaxed);

    let ctrl = overflow_control(inner, hw, ev, pos, &confirmed, must_switch);
    let set_id = inner.sets.at(pos).id;

    // mask defers both the reset and the switch to restart
    let masked = ctrl.contains(OvflCtrl::MASK);
    if masked {
        inner.sets.at_mut(pos).reset_pending.union_with(&reset);
        inner.switch_pending |= must_switch;
        inner.pause(hw, cpu);
        inner.state = ContextState::Suspended;
    } else if must_switch {
        switch_sets(inner, hw, None);
    }

    if ctrl.contains(OvflCtrl::NOTIFY) {
        notify(ctx, inner, ev, set_id, confirmed, hw.now, deferred);
        CpuStats::inc(&slot.stats.notifications);
    }

    if !masked && ctrl.contains(OvflCtrl::RESET) {
        inner.apply_resets(hw, pos, &reset, false);
    }

    if !masked {
        hw.backend.unfreeze(cpu);
    }

    OvflOutcome::Handled {
        confirmed: confirmed.count(),
        masked,
    }
}

/// Ask the sampling format, or apply the default policy.
///
/// Without a format every confirmed overflow is reset, and notification
/// is driven by the per-register NOTIFY flag: if any confirmed register
/// carries it, the controller is notified and monitoring is masked unless
/// a set switch was also requested. Registers without the flag overflow
/// silently.
fn overflow_control(
    inner: &mut ContextInner,
    hw: &Hw<'_>,
    ev: OvflEvent,
    pos: usize,
    confirmed: &RegMask,
    must_switch: bool,
) -> OvflCtrl {
    let thread = inner.thread_id();
    let live = inner.loaded_cpu;
    let set = inner.sets.at(pos);

    let Some(format) = inner.format.as_mut() else {
        let mut ctrl = OvflCtrl::RESET;
        if confirmed.iter().any(|i| set.pmds[i].flags.contains(PmdFlags::NOTIFY)) {
            ctrl |= OvflCtrl::NOTIFY;
            if !must_switch {
                ctrl |= OvflCtrl::MASK;
            }
        }
        return ctrl;
    };

    let mut ctrl = OvflCtrl::empty();
    for i in confirmed.iter() {
        let pmd = &set.pmds[i];
        let values: ArrayVec<u64, MAX_SMPL_PMDS> = pmd
            .smpl_pmds
            .iter()
            .take(MAX_SMPL_PMDS)
            .map(|j| current_value(hw, set, j, live))
            .collect();
        let arg = OvflArg {
            ovfl_pmd: i,
            set_id: set.id,
            ip: ev.ip,
            timestamp: hw.now,
            cpu: ev.cpu,
            thread,
            last_reset: pmd.last_reset,
            smpl_pmds: pmd.smpl_pmds,
            smpl_values: &values,
        };
        ctrl |= format.handler(&arg);
    }
    ctrl
}

/// Queue a notification and charge a restart credit
fn notify(
    ctx: &Context,
    inner: &mut ContextInner,
    ev: OvflEvent,
    set_id: crate::SetId,
    confirmed: RegMask,
    now: u64,
    deferred: &mut Deferred,
) {
    inner.credits = inner.credits.saturating_add(1);
    if !ctx.flags().contains(CtxFlags::NO_MSG) {
        let queued = inner.msgs.push(Message::Overflow {
            set_id,
            ovfl_pmds: confirmed,
            ip: ev.ip,
            timestamp: now,
            cpu: ev.cpu,
        });
        if !queued {
            log::warn!("perfmon: {} message queue full, notification dropped", ctx.id());
        }
        deferred.push(DeferredAction::WakeReaders);
    }
    if ctx.flags().contains(CtxFlags::BLOCK) {
        if let Some(Binding::Thread(t)) = inner.binding.as_ref() {
            deferred.push(DeferredAction::PostWork(t.clone(), WorkFlags::BLOCK));
        }
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

impl Perfmon {
    /// Overflow interrupt entry for `cpu`; `ip` is the interrupted
    /// instruction pointer. Called with local interrupts disabled, so the
    /// context lock is taken directly.
    pub fn handle_overflow_interrupt(&self, cpu: CpuId, ip: u64) -> OvflOutcome {
        let Some(slot) = self.cpus.get(cpu.0) else {
            return OvflOutcome::Spurious;
        };
        CpuStats::inc(&slot.stats.interrupts);

        let spurious = || {
            CpuStats::inc(&slot.stats.spurious);
            OvflOutcome::Spurious
        };

        let Some(ctx) = slot.owner() else {
            return spurious();
        };

        let mut deferred = Deferred::new();
        let outcome = {
            let mut inner = ctx.inner.lock();
            if !inner.is_counting() || inner.loaded_cpu != Some(cpu) {
                log::trace!("perfmon: {} interrupt with no live context", cpu);
                drop(inner);
                return spurious();
            }
            let hw = ctx.hw(&self.cpus, self.platform.now_ns());
            let pending = match hw.backend.freeze(cpu) {
                Ok(p) => p,
                Err(_) => {
                    CpuStats::inc(&slot.stats.freeze_failures);
                    log::warn!("perfmon: {} PMU freeze failed", cpu);
                    drop(inner);
                    return spurious();
                },
            };
            let ev = OvflEvent { cpu, ip };
            let outcome = overflow_handler(&ctx, &mut inner, &hw, ev, pending, &mut deferred);
            if outcome == OvflOutcome::Spurious {
                hw.backend.unfreeze(cpu);
            }
            outcome
        };
        deferred.run(&ctx, &self.cpus);

        if outcome == OvflOutcome::Spurious {
            CpuStats::inc(&slot.stats.spurious);
        }
        outcome
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{PMC_ENABLE, PMC_INT};
    use crate::rw::{PmcWrite, PmdRead, PmdWrite};
    use crate::testing::Fixture;
    use crate::{ContextState, Target};

    const CPU: CpuId = CpuId(0);

    #[test]
    fn test_emulation_counts_genuine_overflows_only() {
        // 8-bit hardware counter: every 256 events is a hardware rollover,
        // only the one crossing 2^64 is a logical overflow
        let fx = Fixture::new(1, 1, 8);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .write_pmcs(&h, &caller, &[PmcWrite::new(0, 0, PMC_ENABLE | PMC_INT)])
            .unwrap();
        let start = 0u64.wrapping_sub(3 * 256);
        fx.pfm
            .write_pmds(&h, &caller, &[PmdWrite::new(0, 0, start)])
            .unwrap();
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        fx.pfm.start(&h, &caller).unwrap();

        let mut confirmed = 0;
        let mut genuine_rollovers = 0;
        for _ in 0..5 {
            let mut r = [PmdRead::new(0, 0)];
            fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
            let before = r[0].value;
            fx.pmu.advance(CPU, 0, 256);
            if let Some(OvflOutcome::Handled { confirmed: n, .. }) = fx.pump(CPU) {
                confirmed += n;
            }
            fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
            if r[0].value < before {
                genuine_rollovers += 1;
            }
        }
        assert_eq!(confirmed, 1);
        assert_eq!(genuine_rollovers, 1);
        assert_eq!(fx.pfm.cpu_stats(CPU).unwrap().overflows, 1);
        assert_eq!(h.state(), ContextState::Attached);
    }

    #[test]
    fn test_interrupt_without_owner_is_spurious() {
        let fx = Fixture::new(2, 1, 32);
        assert_eq!(fx.pfm.handle_overflow_interrupt(CpuId(1), 0), OvflOutcome::Spurious);
        let stats = fx.pfm.cpu_stats(CpuId(1)).unwrap();
        assert_eq!(stats.interrupts, 1);
        assert_eq!(stats.spurious, 1);
    }

    #[test]
    fn test_freeze_failure_is_spurious() {
        let fx = Fixture::new(1, 1, 8);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.enable_counter(&h, &caller, 0, 0, u64::MAX);
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        fx.pfm.start(&h, &caller).unwrap();
        fx.pmu.advance(CPU, 0, 1);
        fx.pmu.set_freeze_fault(true);
        assert_eq!(fx.pump(CPU), Some(OvflOutcome::Spurious));
        let stats = fx.pfm.cpu_stats(CPU).unwrap();
        assert_eq!(stats.freeze_failures, 1);
        assert_eq!(stats.spurious, 1);
        assert_eq!(h.state(), ContextState::Attached);
    }

    #[test]
    fn test_notify_masks_and_defers_reset() {
        let fx = Fixture::new(1, 2, 8);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .write_pmcs(&h, &caller, &[PmcWrite::new(0, 0, PMC_ENABLE | PMC_INT)])
            .unwrap();
        let mut w = PmdWrite::new(0, 0, u64::MAX);
        w.flags = PmdFlags::NOTIFY;
        w.short_reset = 0xAAAA;
        w.long_reset = 0xBBBB;
        fx.pfm.write_pmds(&h, &caller, &[w]).unwrap();
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        fx.pfm.start(&h, &caller).unwrap();

        fx.pmu.advance(CPU, 0, 1);
        assert_eq!(
            fx.pump(CPU),
            Some(OvflOutcome::Handled {
                confirmed: 1,
                masked: true
            })
        );
        assert_eq!(h.state(), ContextState::Suspended);
        assert!(!fx.pmu.is_started(CPU));
        // reset deferred: value is the wrapped one
        let mut r = [PmdRead::new(0, 0)];
        fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
        assert_eq!(r[0].value, 0);

        let msg = fx.pfm.read_message(&h, &caller, false).unwrap();
        assert!(matches!(msg, Message::Overflow { set_id: 0, .. }));

        fx.pfm.restart(&h, &caller).unwrap();
        assert_eq!(h.state(), ContextState::Attached);
        fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
        assert_eq!(r[0].value, 0xBBBB);
        assert_eq!(fx.pmu.hw_pmd(CPU, 0), 0xBB);
        assert!(fx.pmu.is_started(CPU));
    }

    #[test]
    fn test_without_notify_flag_only_resets() {
        let fx = Fixture::new(1, 1, 8);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .write_pmcs(&h, &caller, &[PmcWrite::new(0, 0, PMC_ENABLE | PMC_INT)])
            .unwrap();
        let mut w = PmdWrite::new(0, 0, u64::MAX);
        w.short_reset = u64::MAX - 9;
        fx.pfm.write_pmds(&h, &caller, &[w]).unwrap();
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        fx.pfm.start(&h, &caller).unwrap();

        fx.pmu.advance(CPU, 0, 1);
        fx.pump(CPU);
        assert_eq!(h.state(), ContextState::Attached);
        assert_eq!(fx.pmu.hw_pmd(CPU, 0), 0xF6);
        assert!(fx.pmu.is_started(CPU));
        assert_eq!(
            fx.pfm.read_message(&h, &caller, false).unwrap_err().kind(),
            crate::ErrorKind::WouldBlock
        );
    }
}
