//! # Register Capability Table
//!
//! Static description of the PMU register file, produced by the hardware
//! back-end at registration time and shared read-only by every session
//! afterwards.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PmuDescription                          │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  PMC table (control)         │  PMD table (data)             │
//! │  flags, default, rsvd mask   │  flags, kind, dependencies    │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │  counter width ─▶ ovfl_mask = 2^width - 1                    │
//! │  derived masks: impl / counter / intr / read-only            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::bitmap::RegMask;
use crate::error::{PfmError, PfmResult};
use crate::{CpuId, SetId};

// =============================================================================
// REGISTER FLAGS
// =============================================================================

bitflags! {
    /// Capability flags of a single register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegFlags: u32 {
        /// Register is implemented
        const IMPL = 1 << 0;
        /// Data register is a counter
        const COUNTER = 1 << 1;
        /// Counter can raise an overflow interrupt
        const INTR = 1 << 2;
        /// Read-only register
        const RO = 1 << 3;
        /// Software-backed register, never touches hardware
        const VIRTUAL = 1 << 4;
        /// Writes are validated by the back-end
        const WRITE_CHECK = 1 << 5;
        /// Hardware counter is already 64 bits wide
        const NO_EMUL64 = 1 << 6;
        /// Usable by per-thread sessions only
        const THREAD_ONLY = 1 << 7;
        /// Usable by system-wide sessions only
        const SYSTEM_ONLY = 1 << 8;
        /// Control/status register rather than a counter
        const STATUS = 1 << 9;
    }
}

// =============================================================================
// SOFTWARE-BACKED REGISTERS
// =============================================================================

/// Information handed to a software-backed register on access
#[derive(Debug, Clone, Copy)]
pub struct SoftRegAccess {
    /// Processor performing the access
    pub cpu: CpuId,
    /// Set the access targets
    pub set: SetId,
    /// Current shadow value of the register
    pub shadow: u64,
}

/// Behavior of a software-backed ("virtual") data register
pub trait SoftRegister: Send + Sync {
    /// Produce the register value
    fn read_soft(&self, access: &SoftRegAccess) -> u64;

    /// Accept a written value; returns the value to keep as shadow
    fn write_soft(&self, access: &SoftRegAccess, value: u64) -> PfmResult<u64>;
}

/// How a register is backed
#[derive(Clone, Default)]
pub enum RegisterKind {
    /// Physical register reached through the back-end
    #[default]
    Hardware,
    /// Software-backed register
    Soft(Arc<dyn SoftRegister>),
}

impl RegisterKind {
    /// Software behavior, if any
    pub fn soft(&self) -> Option<&dyn SoftRegister> {
        match self {
            Self::Hardware => None,
            Self::Soft(reg) => Some(reg.as_ref()),
        }
    }
}

impl fmt::Debug for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => f.write_str("Hardware"),
            Self::Soft(_) => f.write_str("Soft"),
        }
    }
}

// =============================================================================
// REGISTER CAPABILITY
// =============================================================================

/// Capability of one control or data register
#[derive(Debug, Clone)]
pub struct RegisterCapability {
    /// Human readable name
    pub name: &'static str,
    /// Capability flags
    pub flags: RegFlags,
    /// Default (power-on) value
    pub default: u64,
    /// Reserved bits, always taken from `default`
    pub rsvd_mask: u64,
    /// Control registers a data register requires
    pub deps: RegMask,
    /// Backing
    pub kind: RegisterKind,
}

impl RegisterCapability {
    /// Unimplemented slot
    pub const fn unimplemented() -> Self {
        Self {
            name: "",
            flags: RegFlags::empty(),
            default: 0,
            rsvd_mask: 0,
            deps: RegMask::new(),
            kind: RegisterKind::Hardware,
        }
    }

    /// Control register
    pub fn control(name: &'static str, default: u64, rsvd_mask: u64) -> Self {
        Self {
            name,
            flags: RegFlags::IMPL | RegFlags::STATUS,
            default,
            rsvd_mask,
            deps: RegMask::new(),
            kind: RegisterKind::Hardware,
        }
    }

    /// Interrupt-capable counter controlled by `deps`
    pub fn counter(name: &'static str, deps: RegMask) -> Self {
        Self {
            name,
            flags: RegFlags::IMPL | RegFlags::COUNTER | RegFlags::INTR,
            default: 0,
            rsvd_mask: 0,
            deps,
            kind: RegisterKind::Hardware,
        }
    }

    /// Software-backed data register
    pub fn virtual_reg(name: &'static str, reg: Arc<dyn SoftRegister>) -> Self {
        Self {
            name,
            flags: RegFlags::IMPL | RegFlags::VIRTUAL,
            default: 0,
            rsvd_mask: 0,
            deps: RegMask::new(),
            kind: RegisterKind::Soft(reg),
        }
    }

    /// Add flags
    pub fn with_flags(mut self, flags: RegFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Implemented register
    #[inline]
    pub fn is_impl(&self) -> bool {
        self.flags.contains(RegFlags::IMPL)
    }

    /// Apply reserved-bit policy to a written value
    #[inline]
    pub fn merge_reserved(&self, value: u64) -> u64 {
        (value & !self.rsvd_mask) | (self.default & self.rsvd_mask)
    }
}

// =============================================================================
// PMU DESCRIPTION
// =============================================================================

/// Capability descriptor of a PMU, supplied by the hardware back-end
#[derive(Debug, Clone)]
pub struct PmuDescription {
    /// PMU model name
    pub name: &'static str,
    /// Control registers
    pub pmcs: Vec<RegisterCapability>,
    /// Data registers
    pub pmds: Vec<RegisterCapability>,
    /// Width of the hardware counters in bits
    pub counter_width: u32,
    ovfl_mask: u64,
    impl_pmcs: RegMask,
    impl_pmds: RegMask,
    cnt_pmds: RegMask,
    intr_pmds: RegMask,
}

impl PmuDescription {
    /// Build a description and derive its masks
    pub fn new(
        name: &'static str,
        pmcs: Vec<RegisterCapability>,
        pmds: Vec<RegisterCapability>,
        counter_width: u32,
    ) -> PfmResult<Self> {
        if pmcs.len() > RegMask::CAPACITY || pmds.len() > RegMask::CAPACITY {
            return Err(PfmError::invalid_argument("register table too large"));
        }
        if counter_width == 0 || counter_width > 64 {
            return Err(PfmError::invalid_argument("counter width out of range"));
        }

        let ovfl_mask = if counter_width == 64 {
            u64::MAX
        } else {
            (1u64 << counter_width) - 1
        };

        let mut desc = Self {
            name,
            pmcs,
            pmds,
            counter_width,
            ovfl_mask,
            impl_pmcs: RegMask::new(),
            impl_pmds: RegMask::new(),
            cnt_pmds: RegMask::new(),
            intr_pmds: RegMask::new(),
        };

        for (i, pmc) in desc.pmcs.iter().enumerate() {
            if pmc.is_impl() {
                desc.impl_pmcs.set(i);
            }
        }
        for (i, pmd) in desc.pmds.iter().enumerate() {
            if !pmd.is_impl() {
                continue;
            }
            desc.impl_pmds.set(i);
            if pmd.flags.contains(RegFlags::COUNTER) {
                desc.cnt_pmds.set(i);
                if pmd.flags.contains(RegFlags::INTR) {
                    desc.intr_pmds.set(i);
                }
            }
            if !pmd.deps.is_subset(&desc.impl_pmcs) {
                return Err(PfmError::invalid_argument(
                    "data register depends on unimplemented control register",
                ));
            }
        }

        Ok(desc)
    }

    /// Mask of bits held by the hardware counters
    #[inline]
    pub fn ovfl_mask(&self) -> u64 {
        self.ovfl_mask
    }

    /// Implemented control registers
    #[inline]
    pub fn impl_pmcs(&self) -> &RegMask {
        &self.impl_pmcs
    }

    /// Implemented data registers
    #[inline]
    pub fn impl_pmds(&self) -> &RegMask {
        &self.impl_pmds
    }

    /// Counting data registers
    #[inline]
    pub fn cnt_pmds(&self) -> &RegMask {
        &self.cnt_pmds
    }

    /// Interrupt-capable counters
    #[inline]
    pub fn intr_pmds(&self) -> &RegMask {
        &self.intr_pmds
    }

    /// Number of control register slots
    #[inline]
    pub fn num_pmcs(&self) -> usize {
        self.pmcs.len()
    }

    /// Number of data register slots
    #[inline]
    pub fn num_pmds(&self) -> usize {
        self.pmds.len()
    }

    /// Control register capability, if implemented
    pub fn pmc(&self, index: usize) -> Option<&RegisterCapability> {
        self.pmcs.get(index).filter(|r| r.is_impl())
    }

    /// Data register capability, if implemented
    pub fn pmd(&self, index: usize) -> Option<&RegisterCapability> {
        self.pmds.get(index).filter(|r| r.is_impl())
    }

    /// True if this counter needs 64-bit emulation
    #[inline]
    pub fn emulates_64bit(&self, index: usize) -> bool {
        self.ovfl_mask != u64::MAX
            && self.cnt_pmds.test(index)
            && self
                .pmds
                .get(index)
                .is_some_and(|r| !r.flags.contains(RegFlags::NO_EMUL64))
    }

    /// Registers usable from a session scope
    pub fn scope_view(&self, system_wide: bool) -> (RegMask, RegMask) {
        let excluded = if system_wide {
            RegFlags::THREAD_ONLY
        } else {
            RegFlags::SYSTEM_ONLY
        };
        let mut pmcs = RegMask::new();
        let mut pmds = RegMask::new();
        for i in self.impl_pmcs.iter() {
            if !self.pmcs[i].flags.intersects(excluded) {
                pmcs.set(i);
            }
        }
        for i in self.impl_pmds.iter() {
            if !self.pmds[i].flags.intersects(excluded) {
                pmds.set(i);
            }
        }
        (pmcs, pmds)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    struct Constant(u64);

    impl SoftRegister for Constant {
        fn read_soft(&self, _: &SoftRegAccess) -> u64 {
            self.0
        }

        fn write_soft(&self, _: &SoftRegAccess, _: u64) -> PfmResult<u64> {
            Err(PfmError::invalid_register("constant"))
        }
    }

    fn sample_desc() -> PmuDescription {
        PmuDescription::new(
            "test",
            vec![
                RegisterCapability::control("PMC0", 0x10, 0xF0),
                RegisterCapability::control("PMC1", 0, 0)
                    .with_flags(RegFlags::SYSTEM_ONLY),
            ],
            vec![
                RegisterCapability::counter("PMD0", RegMask::from_bits(&[0])),
                RegisterCapability::unimplemented(),
                RegisterCapability::counter("PMD2", RegMask::new())
                    .with_flags(RegFlags::NO_EMUL64),
                RegisterCapability::virtual_reg("VPMD", Arc::new(Constant(7))),
            ],
            47,
        )
        .unwrap()
    }

    #[test]
    fn test_derived_masks() {
        let d = sample_desc();
        assert_eq!(d.ovfl_mask(), (1u64 << 47) - 1);
        assert_eq!(*d.impl_pmds(), RegMask::from_bits(&[0, 2, 3]));
        assert_eq!(*d.cnt_pmds(), RegMask::from_bits(&[0, 2]));
        assert!(d.pmd(1).is_none());
        assert!(d.emulates_64bit(0));
        assert!(!d.emulates_64bit(2));
        assert!(!d.emulates_64bit(3));
    }

    #[test]
    fn test_reserved_merge() {
        let d = sample_desc();
        let pmc = d.pmc(0).unwrap();
        assert_eq!(pmc.merge_reserved(0xFFFF), 0xFF0F | 0x10);
    }

    #[test]
    fn test_scope_views() {
        let d = sample_desc();
        let (thr_pmcs, _) = d.scope_view(false);
        let (sys_pmcs, _) = d.scope_view(true);
        assert!(!thr_pmcs.test(1));
        assert!(sys_pmcs.test(1));
    }

    #[test]
    fn test_soft_kind() {
        let d = sample_desc();
        let access = SoftRegAccess { cpu: CpuId(0), set: 0, shadow: 0 };
        let soft = d.pmd(3).unwrap().kind.soft().unwrap();
        assert_eq!(soft.read_soft(&access), 7);
        assert!(d.pmd(0).unwrap().kind.soft().is_none());
    }

    #[test]
    fn test_rejects_bad_dependency() {
        let res = PmuDescription::new(
            "bad",
            vec![RegisterCapability::control("PMC0", 0, 0)],
            vec![RegisterCapability::counter("PMD0", RegMask::from_bits(&[5]))],
            32,
        );
        assert!(res.is_err());
    }
}
