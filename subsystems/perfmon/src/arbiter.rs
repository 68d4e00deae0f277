//! # PMU Arbiter
//!
//! Exclusive ownership of the physical register file.
//!
//! ```text
//!  register ──▶ refcnt = 1 (description cached, CPUs quiesced)
//!  acquire  ──▶ refcnt 1 → 2 : views built, CPUs quiesced, back-end reserve
//!               refcnt n → n+1 : shared
//!  release  ──▶ refcnt 2 → 1 : back-end release
//!  unregister ▶ only at refcnt == 1
//! ```
//!
//! The arbiter lock is a global lock: it is taken with a context lock
//! held but never the other way around, and never from interrupt code.

use alloc::sync::Arc;

use spin::Mutex;

use crate::backend::PmuBackend;
use crate::bitmap::RegMask;
use crate::error::{ErrorKind, PfmError, PfmResult};
use crate::regs::PmuDescription;
use crate::CpuId;

// =============================================================================
// REGISTER VIEWS
// =============================================================================

/// Registers usable by one kind of session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegView {
    /// Usable control registers
    pub pmcs: RegMask,
    /// Usable data registers
    pub pmds: RegMask,
}

impl RegView {
    /// True if every register of `pmcs`/`pmds` is in the view
    pub fn covers(&self, pmcs: &RegMask, pmds: &RegMask) -> bool {
        pmcs.is_subset(&self.pmcs) && pmds.is_subset(&self.pmds)
    }
}

/// The three capability views computed at first acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegViews {
    /// Every implemented and available register
    pub all: RegView,
    /// Registers usable by per-thread sessions
    pub thread: RegView,
    /// Registers usable by system-wide sessions
    pub system: RegView,
}

impl RegViews {
    /// Compute the views of `desc`, minus the registers held elsewhere
    pub fn compute(desc: &PmuDescription, backend: &dyn PmuBackend) -> Self {
        let taken = backend.unavailable();
        let restrict = |(pmcs, pmds): (RegMask, RegMask)| RegView {
            pmcs: pmcs.difference(&taken.pmcs),
            pmds: pmds.difference(&taken.pmds),
        };
        Self {
            all: restrict((*desc.impl_pmcs(), *desc.impl_pmds())),
            thread: restrict(desc.scope_view(false)),
            system: restrict(desc.scope_view(true)),
        }
    }

    /// View for a session scope
    pub fn for_scope(&self, system_wide: bool) -> &RegView {
        if system_wide {
            &self.system
        } else {
            &self.thread
        }
    }
}

// =============================================================================
// ARBITER
// =============================================================================

struct Registered {
    backend: Arc<dyn PmuBackend>,
    desc: Arc<PmuDescription>,
}

struct ArbiterInner {
    pmu: Option<Registered>,
    refcnt: usize,
    views: RegViews,
}

/// Global owner of the PMU
pub struct PmuArbiter {
    nr_cpus: usize,
    inner: Mutex<ArbiterInner>,
}

impl core::fmt::Debug for PmuArbiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PmuArbiter")
            .field("pmu", &inner.pmu.as_ref().map(|p| p.desc.name))
            .field("refcnt", &inner.refcnt)
            .finish()
    }
}

impl PmuArbiter {
    /// Arbiter for `nr_cpus` processors
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            inner: Mutex::new(ArbiterInner {
                pmu: None,
                refcnt: 0,
                views: RegViews::default(),
            }),
        }
    }

    fn quiesce_all(&self, backend: &dyn PmuBackend) {
        for cpu in 0..self.nr_cpus {
            backend.quiesce(CpuId(cpu));
        }
    }

    /// Register the hardware back-end; fails if one is already registered
    pub fn register(&self, backend: Arc<dyn PmuBackend>) -> PfmResult<Arc<PmuDescription>> {
        let mut inner = self.inner.lock();
        if inner.pmu.is_some() {
            return Err(PfmError::busy("a PMU is already registered"));
        }
        let desc = Arc::new(backend.describe()?);
        self.quiesce_all(backend.as_ref());
        log::debug!(
            "perfmon: registered PMU {} ({} pmcs, {} pmds, {}-bit counters)",
            desc.name,
            desc.num_pmcs(),
            desc.num_pmds(),
            desc.counter_width
        );
        inner.pmu = Some(Registered {
            backend,
            desc: desc.clone(),
        });
        inner.refcnt = 1;
        Ok(desc)
    }

    /// Remove the back-end; fails while any session holds it
    pub fn unregister(&self) -> PfmResult<()> {
        let mut inner = self.inner.lock();
        let Some(pmu) = inner.pmu.as_ref() else {
            return Err(PfmError::new(ErrorKind::NotSupported, "no PMU registered"));
        };
        if inner.refcnt > 1 {
            return Err(PfmError::busy("PMU in use"));
        }
        self.quiesce_all(pmu.backend.as_ref());
        log::debug!("perfmon: unregistered PMU {}", pmu.desc.name);
        inner.pmu = None;
        inner.refcnt = 0;
        Ok(())
    }

    /// Registered back-end and its description
    pub fn registered(&self) -> PfmResult<(Arc<dyn PmuBackend>, Arc<PmuDescription>)> {
        let inner = self.inner.lock();
        inner
            .pmu
            .as_ref()
            .map(|p| (p.backend.clone(), p.desc.clone()))
            .ok_or(PfmError::new(ErrorKind::NotSupported, "no PMU registered"))
    }

    /// Take a reference on the PMU for a session using `desc`
    pub fn acquire(&self, desc: &Arc<PmuDescription>) -> PfmResult<RegViews> {
        let mut inner = self.inner.lock();
        let Some(pmu) = inner.pmu.as_ref() else {
            return Err(PfmError::new(ErrorKind::NotSupported, "no PMU registered"));
        };
        if !Arc::ptr_eq(&pmu.desc, desc) {
            return Err(PfmError::invalid_state("PMU changed since context creation"));
        }
        if inner.refcnt == 1 {
            let backend = pmu.backend.clone();
            let views = RegViews::compute(&pmu.desc, backend.as_ref());
            self.quiesce_all(backend.as_ref());
            backend.reserve()?;
            inner.views = views;
            log::debug!("perfmon: PMU acquired");
        }
        inner.refcnt += 1;
        Ok(inner.views)
    }

    /// Drop a reference taken by [`acquire`](Self::acquire)
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.refcnt <= 1 {
            log::warn!("perfmon: unbalanced PMU release");
            return;
        }
        inner.refcnt -= 1;
        if inner.refcnt == 1 {
            if let Some(pmu) = inner.pmu.as_ref() {
                pmu.backend.release();
            }
            log::debug!("perfmon: PMU released");
        }
    }

    /// Current reference count (1 = registered, idle)
    pub fn refcnt(&self) -> usize {
        self.inner.lock().refcnt
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimLayout, SimPmu};
    use crate::backend::UnavailableRegs;

    fn sim(layout: SimLayout) -> Arc<SimPmu> {
        Arc::new(SimPmu::new(2, layout))
    }

    #[test]
    fn test_refcount_protocol() {
        let pmu = sim(SimLayout::new(4, 32));
        let arb = PmuArbiter::new(2);
        let desc = arb.register(pmu.clone()).unwrap();
        assert_eq!(arb.refcnt(), 1);
        assert_eq!(pmu.quiesce_calls(), 2);

        arb.acquire(&desc).unwrap();
        assert!(pmu.is_reserved());
        assert_eq!(pmu.quiesce_calls(), 4);
        arb.acquire(&desc).unwrap();
        assert_eq!(pmu.quiesce_calls(), 4);

        assert_eq!(arb.unregister().unwrap_err().kind(), ErrorKind::ResourceBusy);
        arb.release();
        assert!(pmu.is_reserved());
        arb.release();
        assert!(!pmu.is_reserved());
        arb.unregister().unwrap();
        assert!(arb.registered().is_err());
    }

    #[test]
    fn test_double_register_is_busy() {
        let arb = PmuArbiter::new(2);
        arb.register(sim(SimLayout::new(1, 32))).unwrap();
        let err = arb.register(sim(SimLayout::new(1, 32))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
    }

    #[test]
    fn test_views_exclude_unavailable() {
        let mut layout = SimLayout::new(4, 32);
        layout.unavailable = UnavailableRegs {
            pmcs: RegMask::from_bits(&[3]),
            pmds: RegMask::from_bits(&[3]),
        };
        let arb = PmuArbiter::new(2);
        let desc = arb.register(sim(layout)).unwrap();
        let views = arb.acquire(&desc).unwrap();
        assert_eq!(views.all.pmds, RegMask::from_bits(&[0, 1, 2]));
        assert!(!views.thread.pmcs.test(3));
        assert!(views.system.covers(&RegMask::from_bits(&[0]), &RegMask::from_bits(&[2])));
    }

    #[test]
    fn test_failed_reserve_leaves_refcount() {
        let mut layout = SimLayout::new(2, 32);
        layout.refuse_reserve = true;
        let arb = PmuArbiter::new(2);
        let desc = arb.register(sim(layout)).unwrap();
        assert_eq!(arb.acquire(&desc).unwrap_err().kind(), ErrorKind::ResourceBusy);
        assert_eq!(arb.refcnt(), 1);
    }
}
