//! # Default Sampling Format
//!
//! Records one [`SampleEntry`] per overflow into a fixed-capacity buffer
//! shared with the reader. When the buffer fills, monitoring is masked and
//! the controller notified; restart empties the buffer.
//!
//! The handler fills the buffer from the overflow interrupt, so the
//! reader side locks it with local interrupts withheld.

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use spin::Mutex;

use super::{OvflArg, OvflCtrl, SamplingFormat, MAX_SMPL_PMDS};
use crate::error::PfmResult;
use crate::platform::{lock_irqsave, IrqGuard, Platform};
use crate::regs::PmuDescription;
use crate::{ContextId, CpuId, SetId, ThreadId};

/// One recorded overflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    /// Monitored thread, if per-thread
    pub thread: Option<ThreadId>,
    /// Interrupted instruction pointer
    pub ip: u64,
    /// Interrupt timestamp (ns)
    pub timestamp: u64,
    /// Overflowed register
    pub ovfl_pmd: usize,
    /// Value that register was last reset to
    pub last_reset: u64,
    /// Active set
    pub set_id: SetId,
    /// Processor
    pub cpu: CpuId,
    /// Sampled register values
    pub values: ArrayVec<u64, MAX_SMPL_PMDS>,
}

/// Sample buffer contents
#[derive(Debug, Default)]
pub struct SampleBuffer {
    entries: Vec<SampleEntry>,
    capacity: usize,
    overflows: u64,
}

impl SampleBuffer {
    /// Recorded entries
    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    /// Number of recorded entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Overflows seen since creation, recorded or not
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// True when no more entries fit
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

/// Reader side of the buffer
#[derive(Clone)]
pub struct SampleReader {
    buf: Arc<Mutex<SampleBuffer>>,
    platform: Arc<dyn Platform>,
}

impl SampleReader {
    /// Lock the buffer, local interrupts withheld
    pub fn lock(&self) -> IrqGuard<'_, SampleBuffer> {
        lock_irqsave(self.platform.as_ref(), &self.buf)
    }
}

impl core::fmt::Debug for SampleReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SampleReader").finish_non_exhaustive()
    }
}

/// Fixed-capacity sampling buffer format
#[derive(Debug)]
pub struct DefaultFormat {
    capacity: usize,
    buf: Arc<Mutex<SampleBuffer>>,
}

impl DefaultFormat {
    /// Format holding up to `capacity` entries, and the reader handle
    pub fn new(capacity: usize, platform: Arc<dyn Platform>) -> (Self, SampleReader) {
        let buf = Arc::new(Mutex::new(SampleBuffer::default()));
        (
            Self {
                capacity,
                buf: buf.clone(),
            },
            SampleReader { buf, platform },
        )
    }
}

impl SamplingFormat for DefaultFormat {
    fn name(&self) -> &'static str {
        "default"
    }

    fn init(&mut self, _ctx: ContextId, _desc: &PmuDescription) -> PfmResult<()> {
        let mut buf = self.buf.lock();
        buf.entries.try_reserve_exact(self.capacity)?;
        buf.capacity = self.capacity;
        Ok(())
    }

    fn handler(&mut self, arg: &OvflArg<'_>) -> OvflCtrl {
        let mut buf = self.buf.lock();
        buf.overflows += 1;
        if buf.is_full() {
            return OvflCtrl::MASK | OvflCtrl::NOTIFY;
        }
        let mut values = ArrayVec::new();
        values.extend(arg.smpl_values.iter().copied().take(MAX_SMPL_PMDS));
        buf.entries.push(SampleEntry {
            thread: arg.thread,
            ip: arg.ip,
            timestamp: arg.timestamp,
            ovfl_pmd: arg.ovfl_pmd,
            last_reset: arg.last_reset,
            set_id: arg.set_id,
            cpu: arg.cpu,
            values,
        });
        if buf.is_full() {
            OvflCtrl::RESET | OvflCtrl::MASK | OvflCtrl::NOTIFY
        } else {
            OvflCtrl::RESET
        }
    }

    fn restart(&mut self, _attached: bool) -> OvflCtrl {
        self.buf.lock().entries.clear();
        OvflCtrl::RESET
    }

    fn exit(&mut self) {
        let mut buf = self.buf.lock();
        buf.entries.clear();
        buf.capacity = 0;
    }
}
