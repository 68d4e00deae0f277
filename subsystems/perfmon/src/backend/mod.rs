//! # Hardware Back-End Contract
//!
//! The engine is register-count agnostic: everything it knows about the PMU
//! comes from the [`PmuDescription`] returned by [`PmuBackend::describe`],
//! and every register access goes through this trait. Methods take the
//! processor explicitly; reaching another processor's registers is the
//! back-end's business (IPI or direct access).
//!
//! Methods called from the overflow path (`freeze`, `unfreeze`,
//! `read_pmd`, `write_pmd`, `resend_interrupt`) must not block or
//! allocate.

pub mod sim;

use crate::bitmap::RegMask;
use crate::error::PfmResult;
use crate::regs::PmuDescription;
use crate::CpuId;

/// Registers held by other consumers of the PMU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnavailableRegs {
    /// Control registers in use elsewhere
    pub pmcs: RegMask,
    /// Data registers in use elsewhere
    pub pmds: RegMask,
}

/// Failure to freeze the PMU on interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeFault;

/// Hardware back-end operations consumed by the core
pub trait PmuBackend: Send + Sync {
    /// Capability table of this PMU
    fn describe(&self) -> PfmResult<PmuDescription>;

    /// Read a data register
    fn read_pmd(&self, cpu: CpuId, index: usize) -> u64;

    /// Write a data register (only the hardware-width bits are meaningful)
    fn write_pmd(&self, cpu: CpuId, index: usize, value: u64);

    /// Read a control register
    fn read_pmc(&self, cpu: CpuId, index: usize) -> u64;

    /// Write a control register
    fn write_pmc(&self, cpu: CpuId, index: usize, value: u64);

    /// Enable counting with the currently programmed registers
    fn start(&self, cpu: CpuId);

    /// Disable counting; returns overflow bits latched but not yet
    /// delivered as an interrupt
    fn stop(&self, cpu: CpuId) -> RegMask;

    /// Freeze all counters atomically on interrupt; returns the data
    /// registers whose overflow flag is set, and clears those flags
    fn freeze(&self, cpu: CpuId) -> Result<RegMask, FreezeFault>;

    /// Undo [`freeze`](Self::freeze)
    fn unfreeze(&self, cpu: CpuId);

    /// Re-raise the overflow interrupt on `cpu`
    fn resend_interrupt(&self, cpu: CpuId);

    /// Ensure previous register writes are visible before returning
    fn serialize(&self, _cpu: CpuId) {}

    /// Registers reserved by other PMU consumers
    fn unavailable(&self) -> UnavailableRegs {
        UnavailableRegs::default()
    }

    /// Reserve the PMU for this subsystem
    fn reserve(&self) -> PfmResult<()> {
        Ok(())
    }

    /// Release the reservation
    fn release(&self) {}

    /// Put `cpu` into a known, disabled state
    fn quiesce(&self, cpu: CpuId);

    /// Validate a control register value for write-checked registers;
    /// returns the value to program
    fn check_pmc(&self, _index: usize, value: u64) -> PfmResult<u64> {
        Ok(value)
    }
}
