//! # Helix Performance Monitoring
//!
//! Context and event-set multiplexing for hardware performance counters.
//! Several independently configured groups of counter programs ("event
//! sets") share the small physical register file over time, per thread or
//! per processor, with overflow-driven notification and time- or
//! overflow-driven set switching.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             Perfmon service                              │
//! │  create / load / unload / start / stop / restart / rw / sets / messages  │
//! ├───────────────┬───────────────────────────────┬──────────────────────────┤
//! │  PmuArbiter   │           Context             │   Scheduler hooks        │
//! │  SessionTable │  state machine + SetList      │   switch-out / in        │
//! │  (global)     │  spin::Mutex per context      │   thread exit, work      │
//! ├───────────────┴──────────────┬────────────────┴──────────────────────────┤
//! │      Overflow interrupt path │ switch_sets (multiplexing)                │
//! ├──────────────────────────────┴───────────────────────────────────────────┤
//! │  CpuSlot[cpu]: owner context, activation token, switch timer, stats      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  PmuBackend (hardware)            Platform (clock, threads, waits)       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//!
//! Context lock → global arbiter/session locks → per-CPU owner slot.
//! The overflow path and the scheduler hooks take only the context lock and
//! the owner slot, never block and never allocate. Blocking halves
//! (timer cancellation, waking waiters) are returned as [`Deferred`]
//! actions and run after the context lock is dropped.
//!
//! ## Invariants
//!
//! 1. System-wide and per-thread sessions never coexist.
//! 2. A processor or thread is monitored by at most one session.
//! 3. Event sets are created and deleted only while the context is detached.
//! 4. A data register's 64-bit value only ever moves forward by hardware
//!    rollover or by an explicit write/reset.
//!
//! [`Deferred`]: context::Deferred

#![cfg_attr(not(test), no_std)]

// =============================================================================
// EXTERNAL DEPENDENCIES
// =============================================================================

extern crate alloc;

use core::fmt;

use static_assertions::const_assert;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Fixed-capacity bitsets
pub mod bitmap;

/// Error types
pub mod error;

/// Subsystem configuration
pub mod config;

/// Register capability table
pub mod regs;

/// Hardware back-end contract and software model
pub mod backend;

/// Host kernel collaborators
pub mod platform;

/// PMU arbitration
pub mod arbiter;

/// Session reservation table
pub mod session;

/// Per-processor switch timer
pub mod timer;

/// Per-processor slots
pub mod cpu;

/// Event sets
pub mod set;

/// Notification messages
pub mod msg;

/// Reset randomization
pub mod random;

/// Sampling formats
pub mod format;

/// Context state machine
pub mod context;

/// Event set multiplexing
pub mod switch;

/// Overflow interrupt path
pub mod interrupt;

/// Register read/write façade
pub mod rw;

/// Scheduler hooks
pub mod sched;

/// Control surface
pub mod control;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use arbiter::{PmuArbiter, RegView, RegViews};
pub use backend::{PmuBackend, UnavailableRegs};
pub use bitmap::{CpuMask, RegMask};
pub use config::PerfmonConfig;
pub use context::{ContextState, CtxFlags};
pub use control::{Caller, ContextHandle, Perfmon, Target, Unload};
pub use cpu::CpuStatsSnapshot;
pub use error::{ErrorKind, PfmError, PfmResult};
pub use format::{OvflArg, OvflCtrl, SamplingFormat};
pub use msg::Message;
pub use platform::{lock_irqsave, without_interrupts, Completion, IrqGuard, IrqSave, Platform};
pub use regs::{PmuDescription, RegFlags, RegisterCapability, RegisterKind, SoftRegister};
pub use rw::{PmcWrite, PmdRead, PmdWrite};
pub use sched::{PfmThread, WorkFlags};
pub use set::{PmdFlags, SetDesc, SetFlags, SetInfo};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Event set identifier
pub type SetId = u16;

/// Processor index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub usize);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Kernel thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

/// Monitoring context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

// =============================================================================
// CONSTANTS
// =============================================================================

/// Subsystem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set every new context starts with
pub const DEFAULT_SET: SetId = 0;

const_assert!(format::MAX_SMPL_PMDS <= RegMask::CAPACITY);
const_assert!(msg::MSG_QUEUE_DEPTH > 0);
const_assert!(config::DEFAULT_MAX_SETS <= SetId::MAX as usize + 1);
