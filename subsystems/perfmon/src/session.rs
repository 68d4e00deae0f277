//! # Session Reservation Table
//!
//! Global bookkeeping of monitoring sessions: which processors run a
//! system-wide session and how many per-thread sessions exist. The two
//! kinds never coexist. A rejected reservation leaves the table unchanged.

use spin::Mutex;

use crate::bitmap::CpuMask;
use crate::error::{PfmError, PfmResult};
use crate::CpuId;

/// What a session reserves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// System-wide session on one processor
    System(CpuId),
    /// Per-thread session
    Thread,
}

#[derive(Debug, Default)]
struct Sessions {
    sys_cpus: CpuMask,
    threads: usize,
}

/// Global session reservation table
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<Sessions>,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a session slot
    pub fn reserve(&self, kind: SessionKind) -> PfmResult<()> {
        let mut s = self.inner.lock();
        match kind {
            SessionKind::System(cpu) => {
                if s.threads > 0 {
                    return Err(PfmError::busy("per-thread sessions exist"));
                }
                if s.sys_cpus.test(cpu.0) {
                    return Err(PfmError::busy("processor already monitored"));
                }
                s.sys_cpus.set(cpu.0);
            },
            SessionKind::Thread => {
                if !s.sys_cpus.is_empty() {
                    return Err(PfmError::busy("system-wide sessions exist"));
                }
                s.threads += 1;
            },
        }
        log::debug!("perfmon: session reserved {:?}", kind);
        Ok(())
    }

    /// Release a slot taken by [`reserve`](Self::reserve)
    pub fn release(&self, kind: SessionKind) {
        let mut s = self.inner.lock();
        match kind {
            SessionKind::System(cpu) => s.sys_cpus.clear(cpu.0),
            SessionKind::Thread => s.threads = s.threads.saturating_sub(1),
        }
        log::debug!("perfmon: session released {:?}", kind);
    }

    /// Number of system-wide sessions
    pub fn system_sessions(&self) -> usize {
        self.inner.lock().sys_cpus.count()
    }

    /// Number of per-thread sessions
    pub fn thread_sessions(&self) -> usize {
        self.inner.lock().threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_kinds_are_exclusive() {
        let t = SessionTable::new();
        t.reserve(SessionKind::System(CpuId(0))).unwrap();
        let err = t.reserve(SessionKind::Thread).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        t.release(SessionKind::System(CpuId(0)));
        t.reserve(SessionKind::Thread).unwrap();
        t.reserve(SessionKind::Thread).unwrap();
        assert_eq!(t.thread_sessions(), 2);
        let err = t.reserve(SessionKind::System(CpuId(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert_eq!(t.system_sessions(), 0);
    }

    #[test]
    fn test_one_session_per_cpu() {
        let t = SessionTable::new();
        t.reserve(SessionKind::System(CpuId(1))).unwrap();
        t.reserve(SessionKind::System(CpuId(2))).unwrap();
        assert!(t.reserve(SessionKind::System(CpuId(1))).is_err());
        assert_eq!(t.system_sessions(), 2);
    }
}
