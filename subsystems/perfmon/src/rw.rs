//! # Register Read/Write Façade
//!
//! Validates user-supplied register requests and applies them to the
//! right place: the event set's soft state always, and the live hardware
//! too when the target set is active and loaded on a processor.
//!
//! Writes are validated as a batch before anything is applied, so a
//! rejected request leaves the context untouched.

use alloc::vec::Vec;

use crate::arbiter::RegView;
use crate::bitmap::RegMask;
use crate::context::{ContextInner, Hw};
use crate::error::{PfmError, PfmResult};
use crate::format::MAX_SMPL_PMDS;
use crate::interrupt::current_value;
use crate::regs::{RegFlags, SoftRegAccess};
use crate::set::PmdFlags;
use crate::{CpuId, SetId};

// =============================================================================
// REQUESTS
// =============================================================================

/// Control register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmcWrite {
    /// Target set
    pub set: SetId,
    /// Register index
    pub index: usize,
    /// Value
    pub value: u64,
}

impl PmcWrite {
    /// Write `value` to control register `index` of `set`
    pub fn new(set: SetId, index: usize, value: u64) -> Self {
        Self { set, index, value }
    }
}

/// Data register write with its overflow configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmdWrite {
    /// Target set
    pub set: SetId,
    /// Register index
    pub index: usize,
    /// 64-bit value
    pub value: u64,
    /// Reset value at interrupt time
    pub short_reset: u64,
    /// Reset value at restart
    pub long_reset: u64,
    /// Randomization mask (with [`PmdFlags::RANDOM`])
    pub random_mask: u64,
    /// Register flags
    pub flags: PmdFlags,
    /// Registers reset when this one overflows
    pub reset_pmds: RegMask,
    /// Registers sampled when this one overflows
    pub smpl_pmds: RegMask,
    /// Overflows before a set switch (0 = never)
    pub ovfl_switch: u64,
}

impl PmdWrite {
    /// Write `value` to data register `index` of `set`, no overflow options
    pub fn new(set: SetId, index: usize, value: u64) -> Self {
        Self {
            set,
            index,
            value,
            short_reset: 0,
            long_reset: 0,
            random_mask: 0,
            flags: PmdFlags::empty(),
            reset_pmds: RegMask::new(),
            smpl_pmds: RegMask::new(),
            ovfl_switch: 0,
        }
    }

    /// Same reset value at interrupt time and at restart
    pub fn with_reset(mut self, reset: u64) -> Self {
        self.short_reset = reset;
        self.long_reset = reset;
        self
    }

    /// Add register flags
    pub fn with_flags(mut self, flags: PmdFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Switch sets after `n` overflows
    pub fn with_ovfl_switch(mut self, n: u64) -> Self {
        self.ovfl_switch = n;
        self
    }
}

/// Data register read; `value` and `last_reset` are filled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmdRead {
    /// Target set
    pub set: SetId,
    /// Register index
    pub index: usize,
    /// 64-bit value
    pub value: u64,
    /// Value of the last reset
    pub last_reset: u64,
}

impl PmdRead {
    /// Read data register `index` of `set`
    pub fn new(set: SetId, index: usize) -> Self {
        Self {
            set,
            index,
            value: 0,
            last_reset: 0,
        }
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl ContextInner {
    /// Processor holding `set` live, if any
    fn live_cpu(&self, set: SetId) -> Option<CpuId> {
        self.loaded_cpu.filter(|_| self.sets.active().id == set)
    }

    pub(crate) fn write_pmcs(&mut self, hw: &Hw<'_>, view: &RegView, req: &[PmcWrite]) -> PfmResult<()> {
        let mut checked = Vec::new();
        checked.try_reserve_exact(req.len())?;
        for w in req {
            if self.sets.get(w.set).is_none() {
                return Err(PfmError::invalid_argument("no such set"));
            }
            if !view.pmcs.test(w.index) {
                return Err(PfmError::invalid_register("control register unavailable"));
            }
            let cap = hw
                .desc
                .pmc(w.index)
                .ok_or(PfmError::invalid_register("control register not implemented"))?;
            let mut value = cap.merge_reserved(w.value);
            if cap.flags.contains(RegFlags::WRITE_CHECK) {
                value = hw.backend.check_pmc(w.index, value)?;
            }
            checked.push((w.set, w.index, value));
        }

        for (set_id, index, value) in checked {
            let live = self.live_cpu(set_id);
            if let Some(set) = self.sets.get_mut(set_id) {
                set.pmcs[index] = value;
                set.used_pmcs.set(index);
            }
            if let Some(cpu) = live {
                hw.backend.write_pmc(cpu, index, value);
            }
        }
        if let Some(cpu) = self.loaded_cpu {
            hw.backend.serialize(cpu);
        }
        self.invalidate_lazy();
        Ok(())
    }

    pub(crate) fn write_pmds(&mut self, hw: &Hw<'_>, view: &RegView, req: &[PmdWrite]) -> PfmResult<()> {
        for w in req {
            if self.sets.get(w.set).is_none() {
                return Err(PfmError::invalid_argument("no such set"));
            }
            if !view.pmds.test(w.index) {
                return Err(PfmError::invalid_register("data register unavailable"));
            }
            let cap = hw
                .desc
                .pmd(w.index)
                .ok_or(PfmError::invalid_register("data register not implemented"))?;
            if cap.flags.contains(RegFlags::RO) {
                return Err(PfmError::invalid_register("data register is read-only"));
            }
            if !cap.deps.is_subset(&view.pmcs) {
                return Err(PfmError::invalid_register("dependent control register unavailable"));
            }
            if w.flags.contains(PmdFlags::NOTIFY) && !hw.desc.intr_pmds().test(w.index) {
                return Err(PfmError::invalid_argument("register cannot interrupt"));
            }
            if !w.reset_pmds.is_subset(hw.desc.impl_pmds()) || !w.smpl_pmds.is_subset(hw.desc.impl_pmds()) {
                return Err(PfmError::invalid_argument("bad reset or sample register list"));
            }
            if w.smpl_pmds.count() > MAX_SMPL_PMDS {
                return Err(PfmError::invalid_argument("too many sampled registers"));
            }
        }

        for w in req {
            let live = self.live_cpu(w.set);
            let Some(set) = self.sets.get_mut(w.set) else {
                continue;
            };
            let cap = &hw.desc.pmds[w.index];

            // claim control registers the counter depends on
            for d in cap.deps.iter() {
                if !set.used_pmcs.test(d) {
                    set.used_pmcs.set(d);
                    if let Some(cpu) = live {
                        hw.backend.write_pmc(cpu, d, set.pmcs[d]);
                    }
                }
            }

            let value = match cap.kind.soft() {
                Some(soft) => {
                    let access = SoftRegAccess {
                        cpu: live.unwrap_or_default(),
                        set: set.id,
                        shadow: set.pmds[w.index].value,
                    };
                    soft.write_soft(&access, w.value)?
                },
                None => w.value,
            };

            let pmd = &mut set.pmds[w.index];
            pmd.value = value;
            pmd.last_reset = value;
            pmd.short_reset = w.short_reset;
            pmd.long_reset = w.long_reset;
            pmd.random_mask = w.random_mask;
            pmd.flags = w.flags;
            pmd.reset_pmds = w.reset_pmds;
            pmd.smpl_pmds = w.smpl_pmds;
            pmd.ovflsw_ref = w.ovfl_switch;
            pmd.ovflsw_thres = w.ovfl_switch;
            set.used_pmds.set(w.index);
            set.pending_ovfl.clear(w.index);
            set.reset_pending.clear(w.index);

            if let Some(cpu) = live {
                if hw.is_hw_pmd(w.index) {
                    hw.backend.write_pmd(cpu, w.index, hw.to_hw(w.index, value));
                }
            }
        }
        if let Some(cpu) = self.loaded_cpu {
            hw.backend.serialize(cpu);
        }
        self.invalidate_lazy();
        Ok(())
    }

    pub(crate) fn read_pmds(&self, hw: &Hw<'_>, req: &mut [PmdRead]) -> PfmResult<()> {
        for r in req.iter_mut() {
            let set = self
                .sets
                .get(r.set)
                .ok_or(PfmError::invalid_argument("no such set"))?;
            if hw.desc.pmd(r.index).is_none() || !set.used_pmds.test(r.index) {
                return Err(PfmError::invalid_register("data register not claimed"));
            }
            let live = self.live_cpu(r.set);
            r.value = current_value(hw, set, r.index, live);
            r.last_reset = set.pmds[r.index].last_reset;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{PMC_ENABLE, PMC_FORBIDDEN, PMC_RSVD};
    use crate::testing::Fixture;
    use crate::{CtxFlags, ErrorKind, Target};

    #[test]
    fn test_read_requires_claim() {
        let fx = Fixture::new(1, 2, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        let mut r = [PmdRead::new(0, 1)];
        let err = fx.pfm.read_pmds(&h, &caller, &mut r).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRegister);
        fx.pfm.write_pmds(&h, &caller, &[PmdWrite::new(0, 1, 77)]).unwrap();
        fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
        assert_eq!(r[0].value, 77);
        assert_eq!(r[0].last_reset, 77);
    }

    #[test]
    fn test_reserved_bits_and_write_check() {
        let fx = Fixture::new(1, 1, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .write_pmcs(&h, &caller, &[PmcWrite::new(0, 0, PMC_RSVD | PMC_ENABLE)])
            .unwrap();
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), None).unwrap();
        assert_eq!(fx.pmu.hw_pmc(CpuId(0), 0), PMC_ENABLE);

        let err = fx
            .pfm
            .write_pmcs(&h, &caller, &[PmcWrite::new(0, 0, PMC_FORBIDDEN)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(fx.pmu.hw_pmc(CpuId(0), 0), PMC_ENABLE);
    }

    #[test]
    fn test_batch_rejected_as_a_whole() {
        let fx = Fixture::new(1, 2, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        let err = fx
            .pfm
            .write_pmds(&h, &caller, &[PmdWrite::new(0, 0, 5), PmdWrite::new(0, 9, 5)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRegister);
        let mut r = [PmdRead::new(0, 0)];
        assert!(fx.pfm.read_pmds(&h, &caller, &mut r).is_err());
    }

    #[test]
    fn test_pmd_write_claims_dependencies() {
        let fx = Fixture::new(1, 2, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm.write_pmds(&h, &caller, &[PmdWrite::new(0, 1, 0)]).unwrap();
        let inner = h.context().inner.lock();
        assert!(inner.sets.active().used_pmcs.test(1));
        assert!(!inner.sets.active().used_pmcs.test(0));
    }

    #[test]
    fn test_write_to_inactive_set_stays_in_shadow() {
        let fx = Fixture::new(1, 1, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        fx.pfm
            .create_evtsets(&h, &caller, &mut [crate::SetDesc::new(1)])
            .unwrap();
        fx.enable_counter(&h, &caller, 0, 0, 10);
        fx.pfm.load(&h, &caller, Target::Thread(t.clone()), Some(0)).unwrap();
        fx.pfm.write_pmds(&h, &caller, &[PmdWrite::new(1, 0, 999)]).unwrap();
        assert_eq!(fx.pmu.hw_pmd(CpuId(0), 0), 10);
        let mut r = [PmdRead::new(1, 0)];
        fx.pfm.read_pmds(&h, &caller, &mut r).unwrap();
        assert_eq!(r[0].value, 999);
    }

    #[test]
    fn test_overflow_options_validated() {
        let fx = Fixture::new(1, 1, 32);
        let t = fx.thread(1);
        let caller = fx.caller(&t, 0);
        let h = fx.create(CtxFlags::empty());
        let w = PmdWrite::new(0, 0, 0).with_flags(PmdFlags::NOTIFY);
        assert!(fx.pfm.write_pmds(&h, &caller, &[w]).is_ok());
        let mut bad = PmdWrite::new(0, 0, 0);
        bad.smpl_pmds = RegMask::from_bits(&[40]);
        assert_eq!(
            fx.pfm.write_pmds(&h, &caller, &[bad]).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
