//! Test support: a scripted [`Platform`] and a fixture wiring a
//! [`Perfmon`] to the software PMU.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::backend::sim::{SimLayout, SimPmu, PMC_ENABLE, PMC_INT};
use crate::backend::PmuBackend;
use crate::context::CtxFlags;
use crate::control::{Caller, ContextHandle, Perfmon};
use crate::interrupt::OvflOutcome;
use crate::platform::Platform;
use crate::regs::PmuDescription;
use crate::rw::{PmcWrite, PmdWrite};
use crate::sched::PfmThread;
use crate::{CpuId, PerfmonConfig, PfmResult, SetId, ThreadId};

/// Clock origin; nonzero so that activation windows never start at 0
const BOOT_NS: u64 = 1_000_000_000;

std::thread_local! {
    // one std thread plays one processor
    static IRQS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

#[derive(Debug, Default)]
struct ThreadFlags {
    stopped: Vec<ThreadId>,
    exiting: Vec<ThreadId>,
    kernel: Vec<ThreadId>,
    signals: Vec<ThreadId>,
}

fn toggle(list: &mut Vec<ThreadId>, t: ThreadId, on: bool) {
    list.retain(|x| *x != t);
    if on {
        list.push(t);
    }
}

/// Platform with a manual clock and per-thread switches
#[derive(Debug)]
pub(crate) struct TestPlatform {
    now: AtomicU64,
    inactive_waits: AtomicU64,
    threads: Mutex<ThreadFlags>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(BOOT_NS),
            inactive_waits: AtomicU64::new(0),
            threads: Mutex::new(ThreadFlags::default()),
        }
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_stopped(&self, t: ThreadId, on: bool) {
        toggle(&mut self.threads.lock().stopped, t, on);
    }

    pub fn set_exiting(&self, t: ThreadId, on: bool) {
        toggle(&mut self.threads.lock().exiting, t, on);
    }

    pub fn set_kernel(&self, t: ThreadId, on: bool) {
        toggle(&mut self.threads.lock().kernel, t, on);
    }

    pub fn raise_signal(&self, t: ThreadId) {
        toggle(&mut self.threads.lock().signals, t, true);
    }

    pub fn clear_signal(&self, t: ThreadId) {
        toggle(&mut self.threads.lock().signals, t, false);
    }

    /// Number of `wait_inactive` calls so far
    pub fn inactive_waits(&self) -> u64 {
        self.inactive_waits.load(Ordering::SeqCst)
    }

    /// Local interrupt state of the calling std thread
    pub fn irqs_enabled(&self) -> bool {
        IRQS_ENABLED.with(Cell::get)
    }
}

impl Platform for TestPlatform {
    fn now_ns(&self) -> u64 {
        self.now()
    }

    fn is_kernel_thread(&self, thread: ThreadId) -> bool {
        self.threads.lock().kernel.contains(&thread)
    }

    fn is_exiting(&self, thread: ThreadId) -> bool {
        self.threads.lock().exiting.contains(&thread)
    }

    fn is_stopped(&self, thread: ThreadId) -> bool {
        self.threads.lock().stopped.contains(&thread)
    }

    fn wait_inactive(&self, _thread: ThreadId) -> PfmResult<()> {
        self.inactive_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signal_pending(&self, thread: ThreadId) -> bool {
        self.threads.lock().signals.contains(&thread)
    }

    fn relax(&self) {
        std::thread::yield_now();
    }

    fn disable_interrupts(&self) -> bool {
        IRQS_ENABLED.with(|irq| irq.replace(false))
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        if was_enabled {
            IRQS_ENABLED.with(|irq| irq.set(true));
        }
    }
}

/// Description of a simulated PMU with `counters` counters
pub(crate) fn sim_desc(counters: usize, width: u32) -> PmuDescription {
    SimPmu::new(1, SimLayout::new(counters, width))
        .describe()
        .unwrap()
}

/// Service, software PMU and platform wired together
#[derive(Debug)]
pub(crate) struct Fixture {
    pub pfm: Perfmon,
    pub pmu: Arc<SimPmu>,
    pub platform: Arc<TestPlatform>,
}

impl Fixture {
    pub fn new(nr_cpus: usize, counters: usize, width: u32) -> Self {
        Self::with_config(PerfmonConfig::new(nr_cpus), counters, width)
    }

    pub fn with_config(config: PerfmonConfig, counters: usize, width: u32) -> Self {
        Self::with_layout(config, SimLayout::new(counters, width))
    }

    pub fn with_layout(config: PerfmonConfig, layout: SimLayout) -> Self {
        let pmu = Arc::new(SimPmu::new(config.nr_cpus, layout));
        let platform = Arc::new(TestPlatform::new());
        let pfm = Perfmon::new(config, platform.clone()).unwrap();
        pfm.register_pmu(pmu.clone()).unwrap();
        Self { pfm, pmu, platform }
    }

    pub fn thread(&self, id: u64) -> Arc<PfmThread> {
        PfmThread::new(ThreadId(id))
    }

    pub fn idle_thread(&self, cpu: usize) -> Arc<PfmThread> {
        PfmThread::new_idle(ThreadId(10_000 + cpu as u64))
    }

    pub fn caller<'a>(&self, thread: &'a PfmThread, cpu: usize) -> Caller<'a> {
        Caller::new(thread, CpuId(cpu))
    }

    pub fn create(&self, flags: CtxFlags) -> ContextHandle {
        self.pfm.create_context(flags, None).unwrap()
    }

    /// Enable counter `index` of `set` with interrupts and give it `value`
    pub fn enable_counter(&self, h: &ContextHandle, caller: &Caller<'_>, set: SetId, index: usize, value: u64) {
        self.pfm
            .write_pmcs(h, caller, &[PmcWrite::new(set, index, PMC_ENABLE | PMC_INT)])
            .unwrap();
        self.pfm
            .write_pmds(h, caller, &[PmdWrite::new(set, index, value)])
            .unwrap();
    }

    /// Deliver the interrupt latched on `cpu`, if any
    pub fn pump(&self, cpu: CpuId) -> Option<OvflOutcome> {
        self.pmu
            .take_interrupt(cpu)
            .then(|| self.pfm.handle_overflow_interrupt(cpu, 0xFFFF_0000_0040_1000))
    }
}
