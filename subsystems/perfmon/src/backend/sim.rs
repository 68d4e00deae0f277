//! # Software PMU Model
//!
//! A [`PmuBackend`] that models a simple PMU in memory: `N` control
//! registers, `N` counters of a configurable width where counter `i` is
//! enabled by bit 0 of control register `i`. Counters advance only through
//! [`SimPmu::advance`], roll over at the configured width, and latch an
//! interrupt that the host polls with [`SimPmu::take_interrupt`].
//!
//! Used for bring-up on hosts without a PMU and by the test suite.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::{FreezeFault, PmuBackend, UnavailableRegs};
use crate::bitmap::RegMask;
use crate::error::{PfmError, PfmResult};
use crate::regs::{PmuDescription, RegFlags, RegisterCapability};
use crate::CpuId;

/// Control register bit enabling the paired counter
pub const PMC_ENABLE: u64 = 1 << 0;

/// Control register bit enabling the overflow interrupt of the paired counter
pub const PMC_INT: u64 = 1 << 1;

/// Reserved control register bits (kept at their default of zero)
pub const PMC_RSVD: u64 = 0xFFFF_FFFF_0000_0000;

/// Control register bit the write checker refuses
pub const PMC_FORBIDDEN: u64 = 1 << 31;

// =============================================================================
// LAYOUT
// =============================================================================

/// Register layout of the simulated PMU
#[derive(Debug, Clone)]
pub struct SimLayout {
    /// Number of counter pairs
    pub counters: usize,
    /// Counter width in bits
    pub width: u32,
    /// Registers reported as held by another PMU consumer
    pub unavailable: UnavailableRegs,
    /// Refuse [`PmuBackend::reserve`]
    pub refuse_reserve: bool,
}

impl SimLayout {
    /// `counters` counters of `width` bits
    pub fn new(counters: usize, width: u32) -> Self {
        Self {
            counters,
            width,
            unavailable: UnavailableRegs::default(),
            refuse_reserve: false,
        }
    }
}

// =============================================================================
// PER-CPU HARDWARE STATE
// =============================================================================

#[derive(Debug)]
struct SimCpu {
    pmcs: Vec<u64>,
    pmds: Vec<u64>,
    started: bool,
    frozen: bool,
    status: RegMask,
    irq_pending: bool,
}

impl SimCpu {
    fn new(counters: usize) -> Self {
        Self {
            pmcs: vec![0; counters],
            pmds: vec![0; counters],
            started: false,
            frozen: false,
            status: RegMask::new(),
            irq_pending: false,
        }
    }

    fn counting(&self, index: usize) -> bool {
        self.started && !self.frozen && self.pmcs[index] & PMC_ENABLE != 0
    }
}

// =============================================================================
// SIM PMU
// =============================================================================

/// In-memory PMU model
#[derive(Debug)]
pub struct SimPmu {
    layout: SimLayout,
    mask: u64,
    cpus: Vec<Mutex<SimCpu>>,
    freeze_fault: AtomicBool,
    reserved: AtomicBool,
    quiesce_calls: AtomicUsize,
    resend_calls: AtomicUsize,
}

impl SimPmu {
    /// Model `nr_cpus` processors with the given layout
    pub fn new(nr_cpus: usize, layout: SimLayout) -> Self {
        let mask = if layout.width >= 64 {
            u64::MAX
        } else {
            (1u64 << layout.width) - 1
        };
        let cpus = (0..nr_cpus)
            .map(|_| Mutex::new(SimCpu::new(layout.counters)))
            .collect();
        Self {
            layout,
            mask,
            cpus,
            freeze_fault: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            quiesce_calls: AtomicUsize::new(0),
            resend_calls: AtomicUsize::new(0),
        }
    }

    /// Count `delta` events on counter `index` of `cpu`; returns true if
    /// the hardware counter rolled over
    pub fn advance(&self, cpu: CpuId, index: usize, delta: u64) -> bool {
        let mut hw = self.cpus[cpu.0].lock();
        if index >= hw.pmds.len() || !hw.counting(index) {
            return false;
        }
        let old = hw.pmds[index];
        let sum = old as u128 + delta as u128;
        hw.pmds[index] = (sum as u64) & self.mask;
        let wrapped = sum > self.mask as u128;
        if wrapped && hw.pmcs[index] & PMC_INT != 0 {
            hw.status.set(index);
            hw.irq_pending = true;
        }
        wrapped
    }

    /// Consume the latched interrupt of `cpu`
    pub fn take_interrupt(&self, cpu: CpuId) -> bool {
        let mut hw = self.cpus[cpu.0].lock();
        core::mem::replace(&mut hw.irq_pending, false)
    }

    /// Make the next freezes fail
    pub fn set_freeze_fault(&self, fault: bool) {
        self.freeze_fault.store(fault, Ordering::SeqCst);
    }

    /// Raw hardware value of a counter
    pub fn hw_pmd(&self, cpu: CpuId, index: usize) -> u64 {
        self.cpus[cpu.0].lock().pmds[index]
    }

    /// Raw hardware value of a control register
    pub fn hw_pmc(&self, cpu: CpuId, index: usize) -> u64 {
        self.cpus[cpu.0].lock().pmcs[index]
    }

    /// Whether `cpu` is counting
    pub fn is_started(&self, cpu: CpuId) -> bool {
        let hw = self.cpus[cpu.0].lock();
        hw.started && !hw.frozen
    }

    /// Whether the PMU is reserved
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Number of quiesce requests seen
    pub fn quiesce_calls(&self) -> usize {
        self.quiesce_calls.load(Ordering::SeqCst)
    }

    /// Number of interrupt replays requested
    pub fn resend_calls(&self) -> usize {
        self.resend_calls.load(Ordering::SeqCst)
    }
}

impl PmuBackend for SimPmu {
    fn describe(&self) -> PfmResult<PmuDescription> {
        let n = self.layout.counters;
        let pmcs = (0..n)
            .map(|_| {
                RegisterCapability::control("PMC", 0, PMC_RSVD).with_flags(RegFlags::WRITE_CHECK)
            })
            .collect();
        let pmds = (0..n)
            .map(|i| RegisterCapability::counter("PMD", RegMask::from_bits(&[i])))
            .collect();
        PmuDescription::new("sim", pmcs, pmds, self.layout.width)
    }

    fn read_pmd(&self, cpu: CpuId, index: usize) -> u64 {
        self.cpus[cpu.0].lock().pmds.get(index).copied().unwrap_or(0)
    }

    fn write_pmd(&self, cpu: CpuId, index: usize, value: u64) {
        let mut hw = self.cpus[cpu.0].lock();
        if let Some(slot) = hw.pmds.get_mut(index) {
            *slot = value & self.mask;
        }
    }

    fn read_pmc(&self, cpu: CpuId, index: usize) -> u64 {
        self.cpus[cpu.0].lock().pmcs.get(index).copied().unwrap_or(0)
    }

    fn write_pmc(&self, cpu: CpuId, index: usize, value: u64) {
        let mut hw = self.cpus[cpu.0].lock();
        if let Some(slot) = hw.pmcs.get_mut(index) {
            *slot = value;
        }
    }

    fn start(&self, cpu: CpuId) {
        let mut hw = self.cpus[cpu.0].lock();
        hw.started = true;
        hw.frozen = false;
    }

    fn stop(&self, cpu: CpuId) -> RegMask {
        let mut hw = self.cpus[cpu.0].lock();
        hw.started = false;
        if hw.irq_pending {
            hw.irq_pending = false;
            core::mem::take(&mut hw.status)
        } else {
            RegMask::new()
        }
    }

    fn freeze(&self, cpu: CpuId) -> Result<RegMask, FreezeFault> {
        if self.freeze_fault.load(Ordering::SeqCst) {
            return Err(FreezeFault);
        }
        let mut hw = self.cpus[cpu.0].lock();
        hw.frozen = true;
        Ok(core::mem::take(&mut hw.status))
    }

    fn unfreeze(&self, cpu: CpuId) {
        self.cpus[cpu.0].lock().frozen = false;
    }

    fn resend_interrupt(&self, cpu: CpuId) {
        self.resend_calls.fetch_add(1, Ordering::SeqCst);
        self.cpus[cpu.0].lock().irq_pending = true;
    }

    fn unavailable(&self) -> UnavailableRegs {
        self.layout.unavailable
    }

    fn reserve(&self) -> PfmResult<()> {
        if self.layout.refuse_reserve {
            return Err(PfmError::busy("PMU held by another consumer"));
        }
        self.reserved.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.reserved.store(false, Ordering::SeqCst);
    }

    fn quiesce(&self, cpu: CpuId) {
        self.quiesce_calls.fetch_add(1, Ordering::SeqCst);
        let mut hw = self.cpus[cpu.0].lock();
        hw.started = false;
        hw.frozen = false;
        hw.status.clear_all();
        hw.irq_pending = false;
        hw.pmcs.iter_mut().for_each(|v| *v = 0);
    }

    fn check_pmc(&self, _index: usize, value: u64) -> PfmResult<u64> {
        if value & PMC_FORBIDDEN != 0 {
            return Err(PfmError::invalid_argument("forbidden control bit"));
        }
        Ok(value)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: CpuId = CpuId(0);

    #[test]
    fn test_counts_only_when_enabled_and_started() {
        let pmu = SimPmu::new(1, SimLayout::new(2, 16));
        assert!(!pmu.advance(CPU, 0, 10));
        pmu.write_pmc(CPU, 0, PMC_ENABLE);
        assert!(!pmu.advance(CPU, 0, 10));
        pmu.start(CPU);
        pmu.advance(CPU, 0, 10);
        assert_eq!(pmu.hw_pmd(CPU, 0), 10);
        assert_eq!(pmu.hw_pmd(CPU, 1), 0);
    }

    #[test]
    fn test_rollover_latches_interrupt() {
        let pmu = SimPmu::new(1, SimLayout::new(1, 8));
        pmu.write_pmc(CPU, 0, PMC_ENABLE | PMC_INT);
        pmu.write_pmd(CPU, 0, 0xFE);
        pmu.start(CPU);
        assert!(pmu.advance(CPU, 0, 3));
        assert_eq!(pmu.hw_pmd(CPU, 0), 1);
        assert!(pmu.take_interrupt(CPU));
        assert!(!pmu.take_interrupt(CPU));
        assert_eq!(pmu.freeze(CPU).unwrap(), RegMask::from_bits(&[0]));
        assert!(!pmu.advance(CPU, 0, 1));
    }

    #[test]
    fn test_stop_returns_undelivered_overflow() {
        let pmu = SimPmu::new(1, SimLayout::new(1, 8));
        pmu.write_pmc(CPU, 0, PMC_ENABLE | PMC_INT);
        pmu.write_pmd(CPU, 0, 0xFF);
        pmu.start(CPU);
        pmu.advance(CPU, 0, 1);
        assert_eq!(pmu.stop(CPU), RegMask::from_bits(&[0]));
        assert!(!pmu.take_interrupt(CPU));
    }

    #[test]
    fn test_describe_matches_layout() {
        let pmu = SimPmu::new(1, SimLayout::new(3, 32));
        let desc = pmu.describe().unwrap();
        assert_eq!(desc.num_pmds(), 3);
        assert_eq!(desc.ovfl_mask(), 0xFFFF_FFFF);
        assert!(desc.pmd(2).unwrap().deps.test(2));
    }
}
