//! # Scheduler Hooks
//!
//! The scheduler calls [`Perfmon::context_switch`] on every switch
//! involving a thread that [`PfmThread::needs_hooks`], calls
//! [`Perfmon::thread_exit`] when a thread dies and
//! [`Perfmon::handle_work`] on every return toward user mode.
//!
//! ```text
//!  switch-out (prev)                      switch-in (next)
//!  ─────────────────                      ────────────────
//!  stop, fold live values                 same CPU and token? skip reload
//!  keep remaining time slice              else load pmcs + pmds, new token
//!  MP: drop CPU ownership                 replay overflow seen while out
//!  UP: keep it (lazy save)                resume, re-arm switch timer
//! ```
//!
//! Hooks never block and never allocate.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::context::{Context, ContextState, CtxFlags, Deferred, DeferredAction};
use crate::control::Perfmon;
use crate::cpu::CpuStats;
use crate::error::PfmResult;
use crate::msg::Message;
use crate::{CpuId, ThreadId};

bitflags! {
    /// Work a thread performs at its next return toward user mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WorkFlags: u32 {
        /// Block until the notification is acknowledged
        const BLOCK = 1 << 0;
        /// Apply an acknowledged restart
        const RESET = 1 << 1;
        /// Complete teardown of a defunct context
        const ZOMBIE = 1 << 2;
    }
}

// =============================================================================
// THREAD
// =============================================================================

/// Perfmon view of a kernel thread
#[derive(Debug)]
pub struct PfmThread {
    id: ThreadId,
    idle: bool,
    pub(crate) ctx: Mutex<Option<Arc<Context>>>,
    work: AtomicU32,
    ctxsw: AtomicBool,
}

impl PfmThread {
    /// Regular thread
    pub fn new(id: ThreadId) -> Arc<Self> {
        Arc::new(Self::build(id, false))
    }

    /// Idle thread of a processor
    pub fn new_idle(id: ThreadId) -> Arc<Self> {
        Arc::new(Self::build(id, true))
    }

    fn build(id: ThreadId, idle: bool) -> Self {
        Self {
            id,
            idle,
            ctx: Mutex::new(None),
            work: AtomicU32::new(0),
            ctxsw: AtomicBool::new(false),
        }
    }

    /// Thread identifier
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Idle thread
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Context attached to this thread
    pub fn context(&self) -> Option<Arc<Context>> {
        self.ctx.lock().clone()
    }

    /// Work posted and not yet handled
    pub fn pending_work(&self) -> WorkFlags {
        WorkFlags::from_bits_truncate(self.work.load(Ordering::Acquire))
    }

    pub(crate) fn post_work(&self, work: WorkFlags) {
        self.work.fetch_or(work.bits(), Ordering::AcqRel);
    }

    fn take_work(&self) -> WorkFlags {
        WorkFlags::from_bits_truncate(self.work.swap(0, Ordering::AcqRel))
    }

    /// Switched in on a processor with a system-wide session
    pub fn has_ctxsw_marker(&self) -> bool {
        self.ctxsw.load(Ordering::Acquire)
    }

    /// The scheduler must call the hooks for this thread
    pub fn needs_hooks(&self) -> bool {
        self.has_ctxsw_marker() || self.ctx.lock().is_some()
    }
}

// =============================================================================
// HOOKS
// =============================================================================

impl Perfmon {
    /// Context switch from `prev` to `next` on `cpu`
    pub fn context_switch(&self, cpu: CpuId, prev: &PfmThread, next: &PfmThread) {
        let Some(slot) = self.cpus.get(cpu.0) else {
            return;
        };

        if let Some(sys) = slot.owner().filter(|c| c.is_system()) {
            next.ctxsw.store(true, Ordering::Release);
            if sys.flags().contains(CtxFlags::EXCL_IDLE) && prev.idle != next.idle {
                self.idle_transition(&sys, cpu, next.idle);
            }
            CpuStats::inc(&slot.stats.ctxsw);
            return;
        }

        if let Some(ctx) = prev.context() {
            self.switch_out(&ctx, cpu);
            CpuStats::inc(&slot.stats.ctxsw);
        }
        if let Some(ctx) = next.context() {
            self.switch_in(&ctx, cpu);
            CpuStats::inc(&slot.stats.ctxsw);
        }
    }

    fn switch_out(&self, ctx: &Context, cpu: CpuId) {
        let mut inner = ctx.lock();
        if inner.loaded_cpu != Some(cpu) {
            return;
        }
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.pause(&hw, cpu);
        inner.loaded_cpu = None;
        if !self.config.lazy_save {
            hw.slot(cpu).uninstall(ctx);
            inner.last_act = 0;
        }
    }

    fn switch_in(&self, ctx: &Arc<Context>, cpu: CpuId) {
        let mut inner = ctx.lock();
        if !inner.state.is_bound() {
            return;
        }
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        inner.install(ctx, &hw, cpu, self.config.lazy_save);
        if inner.is_counting() {
            inner.resume(&hw, cpu);
        }
    }

    fn idle_transition(&self, ctx: &Context, cpu: CpuId, to_idle: bool) {
        let mut inner = ctx.lock();
        if inner.loaded_cpu != Some(cpu) {
            return;
        }
        let hw = ctx.hw(&self.cpus, self.platform.now_ns());
        if to_idle {
            if inner.is_counting() {
                inner.pause(&hw, cpu);
            }
            inner.idle_paused = true;
        } else {
            inner.idle_paused = false;
            if inner.is_counting() {
                inner.resume(&hw, cpu);
            }
        }
    }

    /// `thread` is exiting on `cpu`
    pub fn thread_exit(&self, thread: &PfmThread, _cpu: CpuId) {
        thread.ctxsw.store(false, Ordering::Release);
        let Some(ctx) = thread.context() else {
            return;
        };
        let mut deferred = Deferred::new();
        {
            let mut inner = ctx.lock();
            match inner.state {
                ContextState::Attached | ContextState::Suspended | ContextState::Defunct => {
                    self.teardown(&ctx, &mut inner, &mut deferred);
                    if inner.closed {
                        inner.release_format();
                    } else {
                        inner.msgs.push(Message::End);
                        deferred.push(DeferredAction::WakeReaders);
                    }
                },
                ContextState::Detached => {},
            }
        }
        log::debug!("perfmon: {} exited, {} detached", thread.id(), ctx.id());
        deferred.run(&ctx, &self.cpus);
    }

    /// Return-to-user checkpoint of `thread` running on `cpu`
    pub fn handle_work(&self, thread: &PfmThread, cpu: CpuId) -> PfmResult<()> {
        let mut work = thread.take_work();
        while !work.is_empty() {
            if let Some(slot) = self.cpus.get(cpu.0) {
                CpuStats::inc(&slot.stats.work_items);
            }
            let Some(ctx) = thread.context() else {
                return Ok(());
            };
            if work.contains(WorkFlags::ZOMBIE) {
                self.finish_defunct(&ctx);
                return Ok(());
            }
            if work.contains(WorkFlags::BLOCK) {
                ctx.restart_done.wait(self.platform.as_ref(), thread.id())?;
            }
            if work.contains(WorkFlags::RESET) {
                let mut inner = ctx.lock();
                if inner.state.is_bound() {
                    let hw = ctx.hw(&self.cpus, self.platform.now_ns());
                    inner.apply_restart(&hw);
                }
            }
            work = thread.take_work();
        }
        Ok(())
    }

    fn finish_defunct(&self, ctx: &Context) {
        let mut deferred = Deferred::new();
        {
            let mut inner = ctx.lock();
            if inner.state != ContextState::Defunct {
                return;
            }
            self.teardown(ctx, &mut inner, &mut deferred);
            if inner.closed {
                inner.release_format();
            }
        }
        log::debug!("perfmon: {} defunct teardown complete", ctx.id());
        deferred.run(ctx, &self.cpus);
    }
}

// =============================================================================
// TESTS
// =============================================================================
