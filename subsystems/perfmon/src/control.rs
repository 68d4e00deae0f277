//! # Control Surface
//!
//! [`Perfmon`] is the subsystem service. It owns the PMU arbiter, the
//! session table and the per-processor slots, and exposes every operation
//! the syscall layer maps 1:1 onto:
//!
//! | Operation | Legal states |
//! |-----------|--------------|
//! | `create_context` / `close` | any |
//! | `write_pmcs` / `write_pmds` / `read_pmds` | Detached, Attached, Suspended |
//! | `create_evtsets` / `delete_evtsets` | Detached |
//! | `getinfo_evtsets` | any but Defunct |
//! | `load` | Detached |
//! | `unload` / `start` / `stop` / `restart` / `switch_set` | Attached, Suspended |
//!
//! ## Who may operate
//!
//! A detached context accepts any caller. Once bound, a system-wide
//! context only accepts callers running on its processor, and a per-thread
//! context accepts its own thread or any thread while the monitored
//! thread is stopped. The wait for a stopped thread to come off its
//! processor happens before the context lock is taken.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arbiter::{PmuArbiter, RegView};
use crate::backend::PmuBackend;
use crate::bitmap::RegMask;
use crate::config::PerfmonConfig;
use crate::context::{Binding, Context, ContextInner, ContextState, CtxFlags, Deferred, DeferredAction};
use crate::cpu::{CpuSlot, CpuStatsSnapshot};
use crate::error::{ErrorKind, PfmError, PfmResult};
use crate::format::SamplingFormat;
use crate::msg::Message;
use crate::platform::Platform;
use crate::regs::PmuDescription;
use crate::rw::{PmcWrite, PmdRead, PmdWrite};
use crate::sched::{PfmThread, WorkFlags};
use crate::session::{SessionKind, SessionTable};
use crate::set::{EventSet, SetDesc, SetFlags, SetInfo};
use crate::switch::switch_sets;
use crate::{ContextId, CpuId, SetId, DEFAULT_SET};

// =============================================================================
// CALLER / TARGET / HANDLE
// =============================================================================

/// Thread issuing an operation and the processor it runs on
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    /// Calling thread
    pub thread: &'a PfmThread,
    /// Processor the caller runs on
    pub cpu: CpuId,
}

impl<'a> Caller<'a> {
    /// Caller `thread` on `cpu`
    pub fn new(thread: &'a PfmThread, cpu: CpuId) -> Self {
        Self { thread, cpu }
    }
}

/// What to attach a context to
#[derive(Debug, Clone)]
pub enum Target {
    /// Monitor one thread
    Thread(Arc<PfmThread>),
    /// Monitor one processor (system-wide)
    Cpu(CpuId),
}

/// Outcome of [`Perfmon::unload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unload {
    /// Fully detached
    Detached,
    /// Monitored thread is running; it completes teardown itself
    Deferred,
}

/// Exclusive owner of a context, the file-like handle of the syscall
/// layer. Give it back with [`Perfmon::close`].
#[derive(Debug)]
pub struct ContextHandle {
    ctx: Arc<Context>,
}

impl ContextHandle {
    /// Underlying context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Deref for ContextHandle {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

/// How the caller relates to a bound context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Detached, the monitored thread itself, or the bound processor
    Local,
    /// Another thread; the monitored thread is stopped
    StoppedPeer,
    /// Another thread; the monitored thread may be running
    RunningPeer,
}

// =============================================================================
// SERVICE
// =============================================================================

/// Performance monitoring service
pub struct Perfmon {
    pub(crate) config: PerfmonConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) arbiter: PmuArbiter,
    pub(crate) sessions: SessionTable,
    pub(crate) cpus: Vec<CpuSlot>,
    next_ctx: AtomicU64,
}

impl fmt::Debug for Perfmon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Perfmon")
            .field("config", &self.config)
            .field("arbiter", &self.arbiter)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Perfmon {
    /// Service for the processors described by `config`
    pub fn new(config: PerfmonConfig, platform: Arc<dyn Platform>) -> PfmResult<Self> {
        config.validate()?;
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(config.nr_cpus)?;
        cpus.extend((0..config.nr_cpus).map(|i| CpuSlot::new(CpuId(i))));
        log::info!(
            "perfmon: v{} on {} processors (lazy save {})",
            crate::VERSION,
            config.nr_cpus,
            config.lazy_save
        );
        Ok(Self {
            arbiter: PmuArbiter::new(config.nr_cpus),
            sessions: SessionTable::new(),
            config,
            platform,
            cpus,
            next_ctx: AtomicU64::new(1),
        })
    }

    /// Configuration
    pub fn config(&self) -> &PerfmonConfig {
        &self.config
    }

    /// Per-processor slots
    pub fn cpus(&self) -> &[CpuSlot] {
        &self.cpus
    }

    /// Session reservation table
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// PMU arbiter
    pub fn arbiter(&self) -> &PmuArbiter {
        &self.arbiter
    }

    /// Register the hardware back-end
    pub fn register_pmu(&self, backend: Arc<dyn PmuBackend>) -> PfmResult<Arc<PmuDescription>> {
        self.arbiter.register(backend)
    }

    /// Remove the hardware back-end; fails while sessions exist
    pub fn unregister_pmu(&self) -> PfmResult<()> {
        self.arbiter.unregister()
    }

    /// Description of the registered PMU
    pub fn pmu_description(&self) -> Option<Arc<PmuDescription>> {
        self.arbiter.registered().ok().map(|(_, desc)| desc)
    }

    /// Statistics of `cpu`
    pub fn cpu_stats(&self, cpu: CpuId) -> PfmResult<CpuStatsSnapshot> {
        self.cpus
            .get(cpu.0)
            .map(|slot| slot.stats.snapshot())
            .ok_or(PfmError::invalid_argument("no such processor"))
    }

    /// Clear the statistics of every processor
    pub fn reset_stats(&self) {
        for slot in &self.cpus {
            slot.stats.reset();
        }
    }

    // =========================================================================
    // ACCESS
    // =========================================================================

    fn access(&self, inner: &ContextInner, caller: &Caller<'_>) -> PfmResult<Access> {
        match inner.binding.as_ref() {
            None => Ok(Access::Local),
            Some(Binding::Cpu(cpu)) if *cpu == caller.cpu => Ok(Access::Local),
            Some(Binding::Cpu(_)) => Err(PfmError::new(
                ErrorKind::PermissionDenied,
                "system-wide context bound to another processor",
            )),
            Some(Binding::Thread(t)) if t.id() == caller.thread.id() => Ok(Access::Local),
            Some(Binding::Thread(t)) if self.platform.is_stopped(t.id()) => Ok(Access::StoppedPeer),
            Some(Binding::Thread(_)) => Ok(Access::RunningPeer),
        }
    }

    /// Access for operations that touch the monitored state directly
    fn control_access(&self, inner: &ContextInner, caller: &Caller<'_>) -> PfmResult<Access> {
        match self.access(inner, caller)? {
            Access::RunningPeer => Err(PfmError::invalid_state("monitored thread is not stopped")),
            access => Ok(access),
        }
    }

    /// Wait for a stopped monitored thread to leave its processor. Must be
    /// called without the context lock.
    fn settle_peer(&self, ctx: &Context, caller: &Caller<'_>) -> PfmResult<()> {
        let peer = ctx.lock().binding.as_ref().and_then(Binding::thread).cloned();
        match peer {
            Some(t) if t.id() != caller.thread.id() && self.platform.is_stopped(t.id()) => {
                self.platform.wait_inactive(t.id())
            },
            _ => Ok(()),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Create a detached context holding set 0
    pub fn create_context(
        &self,
        flags: CtxFlags,
        mut format: Option<Box<dyn SamplingFormat>>,
    ) -> PfmResult<ContextHandle> {
        if flags.contains(CtxFlags::SYSTEM | CtxFlags::BLOCK) {
            return Err(PfmError::invalid_argument("system-wide contexts cannot block"));
        }
        if flags.contains(CtxFlags::EXCL_IDLE) && !flags.contains(CtxFlags::SYSTEM) {
            return Err(PfmError::invalid_argument("idle exclusion needs a system-wide context"));
        }
        let (backend, desc) = self.arbiter.registered()?;
        let id = ContextId(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        let first = EventSet::new(DEFAULT_SET, &desc)?;
        if let Some(format) = format.as_mut() {
            format.init(id, &desc)?;
        }
        let ctx = Context::new(id, flags, backend, desc, self.platform.clone(), first, format)?;
        log::debug!("perfmon: created {} ({:?})", id, flags);
        Ok(ContextHandle { ctx: Arc::new(ctx) })
    }

    /// Destroy a context. A context bound to a running thread turns
    /// Defunct and is freed by that thread.
    pub fn close(&self, handle: ContextHandle, caller: &Caller<'_>) -> PfmResult<()> {
        let ctx = handle.ctx;
        self.settle_peer(&ctx, caller)?;
        let mut deferred = Deferred::new();
        {
            let mut inner = ctx.lock();
            inner.closed = true;
            match inner.state {
                ContextState::Detached => inner.release_format(),
                ContextState::Defunct => {},
                ContextState::Attached | ContextState::Suspended => {
                    // a system-wide session closed from elsewhere is torn down in place
                    let running_peer = matches!(self.access(&inner, caller), Ok(Access::RunningPeer));
                    if running_peer {
                        self.make_defunct(&mut inner, &mut deferred);
                    } else {
                        self.teardown(&ctx, &mut inner, &mut deferred);
                        inner.release_format();
                    }
                },
            }
        }
        log::debug!("perfmon: closed {}", ctx.id());
        deferred.run(&ctx, &self.cpus);
        Ok(())
    }

    fn make_defunct(&self, inner: &mut ContextInner, deferred: &mut Deferred) {
        inner.state = ContextState::Defunct;
        deferred.push(DeferredAction::WakeBlocked);
        if let Some(t) = inner.binding.as_ref().and_then(Binding::thread) {
            log::debug!("perfmon: {} still running, teardown deferred", t.id());
            deferred.push(DeferredAction::PostWork(t.clone(), WorkFlags::ZOMBIE));
        }
    }

    /// Release everything a bound context holds. Shared by unload, close,
    /// thread exit and deferred teardown.
    pub(crate) fn teardown(&self, ctx: &Context, inner: &mut ContextInner, deferred: &mut Deferred) {
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.detach_hw(ctx, &hw, deferred);
        inner.last_set = Some(inner.sets.active().id);
        match inner.binding.take() {
            Some(Binding::Thread(t)) => {
                let mut slot = t.ctx.lock();
                if slot.as_ref().is_some_and(|c| core::ptr::eq(c.as_ref(), ctx)) {
                    *slot = None;
                }
                drop(slot);
                self.sessions.release(SessionKind::Thread);
                self.arbiter.release();
            },
            Some(Binding::Cpu(cpu)) => {
                self.sessions.release(SessionKind::System(cpu));
                self.arbiter.release();
            },
            None => {},
        }
        inner.state = ContextState::Detached;
        inner.started = false;
        inner.credits = 0;
        inner.switch_pending = false;
        inner.view = RegView::default();
        log::debug!("perfmon: {} detached", ctx.id());
    }

    /// Attach a detached context to `target`, activating `set` (or the
    /// set active at the last unload, or the lowest one)
    pub fn load(
        &self,
        handle: &ContextHandle,
        caller: &Caller<'_>,
        target: Target,
        set: Option<SetId>,
    ) -> PfmResult<()> {
        let ctx = &handle.ctx;
        let system = ctx.is_system();
        let (binding, kind, local) = match target {
            Target::Cpu(cpu) => {
                if !system {
                    return Err(PfmError::invalid_argument("per-thread context on a processor"));
                }
                if cpu.0 >= self.cpus.len() {
                    return Err(PfmError::invalid_argument("no such processor"));
                }
                if cpu != caller.cpu {
                    return Err(PfmError::new(
                        ErrorKind::PermissionDenied,
                        "system-wide load must run on the target processor",
                    ));
                }
                (Binding::Cpu(cpu), SessionKind::System(cpu), Some(cpu))
            },
            Target::Thread(t) => {
                if system {
                    return Err(PfmError::invalid_argument("system-wide context on a thread"));
                }
                let tid = t.id();
                if t.is_idle() || self.platform.is_kernel_thread(tid) {
                    return Err(PfmError::invalid_argument("cannot monitor a kernel thread"));
                }
                if self.platform.is_exiting(tid) {
                    return Err(PfmError::invalid_argument("target thread is exiting"));
                }
                let is_self = tid == caller.thread.id();
                if is_self && ctx.flags().contains(CtxFlags::BLOCK) {
                    return Err(PfmError::invalid_argument("self-monitoring cannot block"));
                }
                if !is_self {
                    if !self.platform.is_stopped(tid) {
                        return Err(PfmError::invalid_state("target thread is not stopped"));
                    }
                    self.platform.wait_inactive(tid)?;
                }
                let local = is_self.then_some(caller.cpu);
                (Binding::Thread(t), SessionKind::Thread, local)
            },
        };

        let mut inner = ctx.lock();
        if inner.state != ContextState::Detached {
            return Err(PfmError::invalid_state("context already attached"));
        }
        let pos = match set.or(inner.last_set.filter(|id| inner.sets.get(*id).is_some())) {
            Some(id) => inner
                .sets
                .position(id)
                .ok_or(PfmError::invalid_argument("no such set"))?,
            None => 0,
        };

        self.sessions.reserve(kind)?;
        let views = match self.arbiter.acquire(&ctx.desc) {
            Ok(views) => views,
            Err(e) => {
                self.sessions.release(kind);
                return Err(e);
            },
        };
        let view = *views.for_scope(system);

        let (mut pmcs, mut pmds) = (RegMask::new(), RegMask::new());
        for s in inner.sets.iter() {
            pmcs.union_with(&s.used_pmcs);
            pmds.union_with(&s.used_pmds);
        }
        let claimed = view.covers(&pmcs, &pmds)
            && match &binding {
                Binding::Thread(t) => {
                    let mut slot = t.ctx.lock();
                    let free = slot.is_none();
                    if free {
                        *slot = Some(ctx.clone());
                    }
                    free
                },
                Binding::Cpu(_) => true,
            };
        if !claimed {
            self.arbiter.release();
            self.sessions.release(kind);
            log::warn!("perfmon: {} load refused, registers or target in use", ctx.id());
            return Err(PfmError::busy("registers or target already in use"));
        }

        inner.view = view;
        inner.binding = Some(binding);
        inner.state = ContextState::Attached;
        inner.credits = 0;
        inner.switch_pending = false;
        inner.idle_paused = false;
        inner.invalidate_lazy();
        inner.sets.set_active(pos);
        inner.sets.active_mut().activate();
        ctx.restart_done.reinit();

        if let Some(cpu) = local {
            let hw = ctx.hw(&self.cpus, self.platform.now_ns());
            inner.install(ctx, &hw, cpu, self.config.lazy_save);
        }
        log::debug!(
            "perfmon: {} attached to {:?}, set {}",
            ctx.id(),
            kind,
            inner.sets.active().id
        );
        Ok(())
    }

    /// Detach from the target
    pub fn unload(&self, handle: &ContextHandle, caller: &Caller<'_>) -> PfmResult<Unload> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut deferred = Deferred::new();
        let outcome = {
            let mut inner = ctx.lock();
            if !inner.state.is_bound() {
                return Err(PfmError::invalid_state("context not attached"));
            }
            match self.access(&inner, caller)? {
                Access::RunningPeer => {
                    self.make_defunct(&mut inner, &mut deferred);
                    Unload::Deferred
                },
                Access::Local | Access::StoppedPeer => {
                    self.teardown(ctx, &mut inner, &mut deferred);
                    Unload::Detached
                },
            }
        };
        deferred.run(ctx, &self.cpus);
        Ok(outcome)
    }

    // =========================================================================
    // MONITORING CONTROL
    // =========================================================================

    /// Begin counting on the active set
    pub fn start(&self, handle: &ContextHandle, caller: &Caller<'_>) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut inner = ctx.lock();
        if !inner.state.is_bound() {
            return Err(PfmError::invalid_state("context not attached"));
        }
        self.control_access(&inner, caller)?;
        if inner.started {
            return Ok(());
        }
        inner.started = true;
        if let Some(cpu) = inner.loaded_cpu {
            if inner.is_counting() {
                let hw = ctx.hw(&self.cpus, self.platform.now_ns());
                inner.resume(&hw, cpu);
            }
        }
        Ok(())
    }

    /// Stop counting, folding live values into the active set
    pub fn stop(&self, handle: &ContextHandle, caller: &Caller<'_>) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut deferred = Deferred::new();
        {
            let mut inner = ctx.lock();
            if !inner.state.is_bound() {
                return Err(PfmError::invalid_state("context not attached"));
            }
            self.control_access(&inner, caller)?;
            if !inner.started {
                return Ok(());
            }
            if let Some(cpu) = inner.loaded_cpu {
                if inner.is_counting() {
                    let hw = ctx.hw(&self.cpus, self.platform.now_ns());
                    inner.pause(&hw, cpu);
                    deferred.push(DeferredAction::CancelTimer(cpu));
                }
            }
            inner.started = false;
        }
        deferred.run(ctx, &self.cpus);
        Ok(())
    }

    /// Acknowledge notifications: apply deferred resets and unmask
    pub fn restart(&self, handle: &ContextHandle, caller: &Caller<'_>) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut deferred = Deferred::new();
        {
            let mut inner = ctx.lock();
            if !inner.state.is_bound() {
                return Err(PfmError::invalid_state("context not attached"));
            }
            if inner.state != ContextState::Suspended && inner.credits == 0 {
                return Err(PfmError::new(ErrorKind::NotAcquired, "no pending notification"));
            }
            let running = match self.access(&inner, caller)? {
                Access::RunningPeer => inner.binding.as_ref().and_then(Binding::thread).cloned(),
                Access::Local | Access::StoppedPeer => None,
            };
            inner.credits = 0;
            match running {
                Some(t) => deferred.push(DeferredAction::PostWork(t, WorkFlags::RESET)),
                None => {
                    let hw = ctx.hw(&self.cpus, self.platform.now_ns());
                    inner.apply_restart(&hw);
                },
            }
            if ctx.flags().contains(CtxFlags::BLOCK) {
                deferred.push(DeferredAction::WakeBlocked);
            }
        }
        deferred.run(ctx, &self.cpus);
        Ok(())
    }

    /// Activate `set`, or the ring successor of the active set
    pub fn switch_set(&self, handle: &ContextHandle, caller: &Caller<'_>, set: Option<SetId>) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut inner = ctx.lock();
        if !inner.state.is_bound() {
            return Err(PfmError::invalid_state("context not attached"));
        }
        self.control_access(&inner, caller)?;
        let target = match set {
            Some(id) => Some(
                inner
                    .sets
                    .position(id)
                    .ok_or(PfmError::invalid_argument("no such set"))?,
            ),
            None => None,
        };
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        switch_sets(&mut inner, &hw, target);
        Ok(())
    }

    /// Switch timer expiry on `cpu`; returns true if the timer fired
    pub fn timer_tick(&self, cpu: CpuId) -> bool {
        let Some(slot) = self.cpus.get(cpu.0) else {
            return false;
        };
        let now = self.platform.now_ns();
        if !slot.timer.expire(now) {
            return false;
        }
        if let Some(ctx) = slot.owner() {
            let mut inner = ctx.lock();
            let timed = inner.sets.active().flags.contains(SetFlags::SWITCH_TIMEOUT);
            if timed && inner.is_counting() && inner.loaded_cpu == Some(cpu) {
                inner.sets.active_mut().remaining_ns = 0;
                let hw = ctx.hw(&self.cpus, now);
                switch_sets(&mut inner, &hw, None);
            }
        }
        slot.timer.finish();
        true
    }

    // =========================================================================
    // REGISTERS
    // =========================================================================

    fn write_view(&self, ctx: &Context, inner: &ContextInner) -> PfmResult<RegView> {
        match inner.state {
            ContextState::Detached => {
                let (pmcs, pmds) = ctx.desc.scope_view(ctx.is_system());
                Ok(RegView { pmcs, pmds })
            },
            ContextState::Attached | ContextState::Suspended => Ok(inner.view),
            ContextState::Defunct => Err(PfmError::invalid_state("context is defunct")),
        }
    }

    /// Program control registers
    pub fn write_pmcs(&self, handle: &ContextHandle, caller: &Caller<'_>, req: &[PmcWrite]) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut inner = ctx.lock();
        self.control_access(&inner, caller)?;
        let view = self.write_view(ctx, &inner)?;
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.write_pmcs(&hw, &view, req)
    }

    /// Program data registers and their overflow behavior
    pub fn write_pmds(&self, handle: &ContextHandle, caller: &Caller<'_>, req: &[PmdWrite]) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let mut inner = ctx.lock();
        self.control_access(&inner, caller)?;
        let view = self.write_view(ctx, &inner)?;
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.write_pmds(&hw, &view, req)
    }

    /// Read 64-bit data register values
    pub fn read_pmds(&self, handle: &ContextHandle, caller: &Caller<'_>, req: &mut [PmdRead]) -> PfmResult<()> {
        let ctx = &handle.ctx;
        self.settle_peer(ctx, caller)?;
        let inner = ctx.lock();
        if inner.state == ContextState::Defunct {
            return Err(PfmError::invalid_state("context is defunct"));
        }
        self.control_access(&inner, caller)?;
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.read_pmds(&hw, req)
    }

    // =========================================================================
    // EVENT SETS
    // =========================================================================

    /// Create sets, or change the policy of existing ones. Effective
    /// timeouts are written back into `descs`.
    pub fn create_evtsets(&self, handle: &ContextHandle, caller: &Caller<'_>, descs: &mut [SetDesc]) -> PfmResult<()> {
        let ctx = &handle.ctx;
        let mut inner = ctx.lock();
        if inner.state != ContextState::Detached {
            return Err(PfmError::invalid_state("event sets change only while detached"));
        }
        self.access(&inner, caller)?;

        let mut fresh = 0;
        for (i, d) in descs.iter().enumerate() {
            d.validate()?;
            if descs[..i].iter().any(|o| o.id == d.id) {
                return Err(PfmError::invalid_argument("duplicate set id"));
            }
            if inner.sets.get(d.id).is_none() {
                fresh += 1;
            }
        }
        if inner.sets.len() + fresh > self.config.max_sets {
            return Err(PfmError::invalid_argument("too many event sets"));
        }

        let mut created = Vec::new();
        created.try_reserve_exact(fresh)?;
        for d in descs.iter_mut() {
            if d.flags.contains(SetFlags::SWITCH_TIMEOUT) {
                d.timeout_ns = self.config.round_timeout(d.timeout_ns);
            } else {
                d.timeout_ns = 0;
            }
            if inner.sets.get(d.id).is_none() {
                created.push(EventSet::new(d.id, &ctx.desc)?);
            }
        }

        for d in descs.iter() {
            if let Some(at) = created.iter().position(|s| s.id == d.id) {
                inner.sets.insert(created.swap_remove(at))?;
            }
            if let Some(set) = inner.sets.get_mut(d.id) {
                set.flags = d.flags;
                set.timeout_ns = d.timeout_ns;
                set.remaining_ns = 0;
            }
        }
        Ok(())
    }

    /// Delete sets; at least one set must remain
    pub fn delete_evtsets(&self, handle: &ContextHandle, caller: &Caller<'_>, ids: &[SetId]) -> PfmResult<()> {
        let ctx = &handle.ctx;
        let mut inner = ctx.lock();
        if inner.state != ContextState::Detached {
            return Err(PfmError::invalid_state("event sets change only while detached"));
        }
        self.access(&inner, caller)?;
        let mut distinct = 0;
        for (i, id) in ids.iter().enumerate() {
            if inner.sets.get(*id).is_none() {
                return Err(PfmError::invalid_argument("no such set"));
            }
            if !ids[..i].contains(id) {
                distinct += 1;
            }
        }
        if distinct >= inner.sets.len() {
            return Err(PfmError::invalid_argument("cannot delete the last event set"));
        }
        for id in ids {
            if inner.sets.get(*id).is_some() {
                inner.sets.remove(*id)?;
            }
            if inner.last_set == Some(*id) {
                inner.last_set = None;
            }
        }
        Ok(())
    }

    /// Describe sets
    pub fn getinfo_evtsets(&self, handle: &ContextHandle, ids: &[SetId]) -> PfmResult<Vec<SetInfo>> {
        let ctx = &handle.ctx;
        let now = self.platform.now_ns();
        let inner = ctx.lock();
        if inner.state == ContextState::Defunct {
            return Err(PfmError::invalid_state("context is defunct"));
        }
        let mut out = Vec::new();
        out.try_reserve_exact(ids.len())?;
        for id in ids {
            let set = inner
                .sets
                .get(*id)
                .ok_or(PfmError::invalid_argument("no such set"))?;
            out.push(set.info(now));
        }
        Ok(out)
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Take the oldest notification. A blocking read waits for one; the
    /// wait is interruptible.
    pub fn read_message(&self, handle: &ContextHandle, caller: &Caller<'_>, blocking: bool) -> PfmResult<Message> {
        let ctx = &handle.ctx;
        loop {
            if let Some(msg) = ctx.lock().msgs.pop() {
                return Ok(msg);
            }
            if !blocking {
                return Err(PfmError::new(ErrorKind::WouldBlock, "no pending message"));
            }
            ctx.msg_ready.wait(self.platform.as_ref(), caller.thread.id())?;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
