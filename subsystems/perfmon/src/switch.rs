//! # Event Set Multiplexing
//!
//! [`switch_sets`] moves a context from its active set to another one.
//! It is called from the control surface (explicit request), from the
//! switch timer and from the overflow path, always with the context
//! locked; it never blocks and never allocates.
//!
//! ```text
//!  (a) stop + fold outgoing     (d) reload switch thresholds
//!  (b) load incoming            (e) apply reset-on-entry
//!  (c) replay pending overflow  (f) resume + re-arm timer
//! ```

use crate::context::{ContextInner, Hw};
use crate::cpu::CpuStats;

/// Activate the set at position `target`, or the ring successor of the
/// active set. When the context is loaded the hardware follows.
pub(crate) fn switch_sets(inner: &mut ContextInner, hw: &Hw<'_>, target: Option<usize>) {
    let from = inner.sets.active_pos();
    let to = target.unwrap_or_else(|| inner.sets.next_pos(from));
    let counting = inner.is_counting();
    let cpu = inner.loaded_cpu;

    if to == from {
        inner.sets.active_mut().reload_thresholds();
        if let Some(cpu) = cpu.filter(|_| counting) {
            // fresh slice for a single-set ring
            inner.disarm_timer(hw, cpu);
            inner.sets.active_mut().remaining_ns = 0;
            inner.arm_timer(hw, cpu);
        }
        return;
    }

    // (a)
    if let Some(cpu) = cpu {
        inner.pause(hw, cpu);
    }
    inner.sets.active_mut().remaining_ns = 0;

    inner.sets.set_active(to);
    let (from_id, to_id) = (inner.sets.at(from).id, inner.sets.active().id);

    if let Some(cpu) = cpu {
        // (b)
        inner.load_regs(hw, cpu);
        // (c)
        if !inner.sets.active().pending_ovfl.is_empty() {
            hw.backend.resend_interrupt(cpu);
            CpuStats::inc(&hw.slot(cpu).stats.replays);
        }
        CpuStats::inc(&hw.slot(cpu).stats.set_switches);
    } else {
        inner.invalidate_lazy();
    }

    // (d)
    inner.sets.active_mut().activate();

    // (e)
    let entry = core::mem::take(&mut inner.sets.active_mut().reset_pending);
    if !entry.is_empty() {
        inner.apply_resets(hw, to, &entry, true);
    }

    // (f)
    if let Some(cpu) = cpu {
        if counting {
            inner.resume(hw, cpu);
        }
    }

    log::trace!("perfmon: set switch {} -> {}", from_id, to_id);
}

#[cfg(test)]
mod tests {
    use crate::rw::{PmdRead, PmdWrite};
    use crate::set::SetDesc;
    use crate::testing::Fixture;
    use crate::{CpuId, CtxFlags, Target};

    #[test]
    fn test_round_trip_restores_values() {
        let fx = Fixture::new(1, 4, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        let mut descs = [SetDesc::new(1)];
        fx.pfm.create_evtsets(&h, &caller, &mut descs).unwrap();
        fx.enable_counter(&h, &caller, 0, 0, 0x1234);
        fx.enable_counter(&h, &caller, 1, 1, 0x9999);
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), Some(0)).unwrap();
        fx.pfm.start(&h, &caller).unwrap();
        fx.pmu.advance(CpuId(0), 0, 6);

        let read0 = |fx: &Fixture| {
            let mut r = [PmdRead::new(0, 0)];
            fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
            r[0].value
        };
        let before = read0(&fx);
        assert_eq!(before, 0x1234 + 6);

        fx.pfm.switch_set(&h, &caller, None).unwrap();
        assert_eq!(h.active_set(), 1);
        // set 1 programs counter 1 only
        assert_eq!(fx.pmu.hw_pmd(CpuId(0), 1), 0x9999);
        fx.pfm.switch_set(&h, &caller, None).unwrap();
        assert_eq!(h.active_set(), 0);
        assert_eq!(read0(&fx), before);
        assert_eq!(fx.pmu.hw_pmd(CpuId(0), 0), before);
    }

    #[test]
    fn test_runs_count_activations() {
        let fx = Fixture::new(1, 2, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .create_evtsets(&h, &caller, &mut [SetDesc::new(5)])
            .unwrap();
        fx.pfm
            .write_pmds(&h, &caller, &[PmdWrite::new(5, 0, 0)])
            .unwrap();
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        for _ in 0..3 {
            fx.pfm.switch_set(&h, &caller, None).unwrap();
        }
        let info = fx.pfm.getinfo_evtsets(&h, &[0, 5]).unwrap();
        assert_eq!(info[0].runs, 2);
        assert_eq!(info[1].runs, 2);
    }
}
