//! # Sampling Formats
//!
//! A sampling format is an optional per-context collaborator consulted on
//! every confirmed overflow. It records whatever it wants and tells the
//! overflow path what to do next through [`OvflCtrl`].
//!
//! Handlers run on the overflow path with the context locked: they must
//! not block and must not allocate.

pub mod default;

use bitflags::bitflags;

use crate::bitmap::RegMask;
use crate::error::PfmResult;
use crate::regs::PmuDescription;
use crate::{ContextId, CpuId, SetId, ThreadId};

/// Maximum number of data registers captured per overflow
pub const MAX_SMPL_PMDS: usize = 16;

bitflags! {
    /// Overflow-path decisions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OvflCtrl: u32 {
        /// Reset the overflowed registers
        const RESET = 1 << 0;
        /// Mask monitoring until restart
        const MASK = 1 << 1;
        /// Notify the controller
        const NOTIFY = 1 << 2;
    }
}

/// Information passed to [`SamplingFormat::handler`] for one overflowed
/// register
#[derive(Debug, Clone, Copy)]
pub struct OvflArg<'a> {
    /// Overflowed data register
    pub ovfl_pmd: usize,
    /// Active set
    pub set_id: SetId,
    /// Interrupted instruction pointer
    pub ip: u64,
    /// Interrupt timestamp (ns)
    pub timestamp: u64,
    /// Processor taking the interrupt
    pub cpu: CpuId,
    /// Monitored thread, if per-thread
    pub thread: Option<ThreadId>,
    /// Value the register was last reset to
    pub last_reset: u64,
    /// Registers whose values follow in `smpl_values`
    pub smpl_pmds: RegMask,
    /// Values of `smpl_pmds`, ascending register order
    pub smpl_values: &'a [u64],
}

/// Per-context sampling collaborator
pub trait SamplingFormat: Send {
    /// Format name
    fn name(&self) -> &'static str;

    /// Called once when the context is created
    fn init(&mut self, _ctx: ContextId, _desc: &PmuDescription) -> PfmResult<()> {
        Ok(())
    }

    /// Called for each confirmed overflow, ascending register order
    fn handler(&mut self, arg: &OvflArg<'_>) -> OvflCtrl;

    /// Called on restart; `attached` tells whether the context is attached
    fn restart(&mut self, _attached: bool) -> OvflCtrl {
        OvflCtrl::RESET
    }

    /// Called once when the context is freed
    fn exit(&mut self) {}
}
