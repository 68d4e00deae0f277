//! # Error Handling
//!
//! Every internal operation returns a [`PfmResult`] to its immediate caller;
//! nothing in the subsystem panics on a recoverable condition. The overflow
//! interrupt path never propagates an error at all: it degrades to
//! "spurious interrupt" and bumps a diagnostic counter instead.
//!
//! ## Error Categories
//!
//! | Kind | Raised when |
//! |------|-------------|
//! | `InvalidState` | operation illegal in the context's current state |
//! | `ResourceBusy` | PMU or session already reserved incompatibly |
//! | `InvalidRegister` | unimplemented index, or read of an unclaimed register |
//! | `NotAcquired` | restart without a pending acknowledgment credit |
//! | `OutOfMemory` | context or event-set allocation failed |

use core::fmt;

// =============================================================================
// ERROR KIND
// =============================================================================

/// Classification of perfmon errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// Operation illegal for the current context state
    InvalidState     = 1,

    /// PMU or monitoring session already reserved incompatibly
    ResourceBusy     = 2,

    /// Unimplemented register, or register not yet claimed by a write
    InvalidRegister  = 3,

    /// Restart without a preceding overflow acknowledgment credit
    NotAcquired      = 4,

    /// Allocation failure
    OutOfMemory      = 5,

    /// Malformed argument (unknown set, conflicting flags, bad target)
    InvalidArgument  = 6,

    /// Non-blocking read on an empty message queue
    WouldBlock       = 7,

    /// Blocking wait aborted by a pending signal
    Interrupted      = 8,

    /// Caller is not allowed to operate on this context from here
    PermissionDenied = 9,

    /// Back-end lacks the requested capability
    NotSupported     = 10,
}

impl ErrorKind {
    /// Short name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InvalidState => "invalid state",
            Self::ResourceBusy => "resource busy",
            Self::InvalidRegister => "invalid register",
            Self::NotAcquired => "not acquired",
            Self::OutOfMemory => "out of memory",
            Self::InvalidArgument => "invalid argument",
            Self::WouldBlock => "would block",
            Self::Interrupted => "interrupted",
            Self::PermissionDenied => "permission denied",
            Self::NotSupported => "not supported",
        }
    }

    /// Negative errno value handed back by the syscall marshalling layer
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidState => -16,     // EBUSY
            Self::ResourceBusy => -16,     // EBUSY
            Self::InvalidRegister => -22,  // EINVAL
            Self::NotAcquired => -16,      // EBUSY
            Self::OutOfMemory => -12,      // ENOMEM
            Self::InvalidArgument => -22,  // EINVAL
            Self::WouldBlock => -11,       // EAGAIN
            Self::Interrupted => -4,       // EINTR
            Self::PermissionDenied => -1,  // EPERM
            Self::NotSupported => -95,     // EOPNOTSUPP
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// PFM ERROR
// =============================================================================

/// Perfmon error: a kind plus a static description of the failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfmError {
    kind: ErrorKind,
    message: &'static str,
}

impl PfmError {
    /// Create a new error
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// Error kind
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Description of the failed check
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// Shorthand for [`ErrorKind::InvalidState`]
    pub const fn invalid_state(message: &'static str) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// Shorthand for [`ErrorKind::ResourceBusy`]
    pub const fn busy(message: &'static str) -> Self {
        Self::new(ErrorKind::ResourceBusy, message)
    }

    /// Shorthand for [`ErrorKind::InvalidRegister`]
    pub const fn invalid_register(message: &'static str) -> Self {
        Self::new(ErrorKind::InvalidRegister, message)
    }

    /// Shorthand for [`ErrorKind::InvalidArgument`]
    pub const fn invalid_argument(message: &'static str) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Shorthand for [`ErrorKind::OutOfMemory`]
    pub const fn out_of_memory(message: &'static str) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }
}

impl fmt::Display for PfmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<alloc::collections::TryReserveError> for PfmError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::out_of_memory("allocation failed")
    }
}

/// Result type for perfmon operations
pub type PfmResult<T> = Result<T, PfmError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display() {
        let e = PfmError::busy("system-wide session active");
        assert_eq!(e.to_string(), "resource busy: system-wide session active");
        assert_eq!(e.kind(), ErrorKind::ResourceBusy);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ErrorKind::WouldBlock.errno(), -11);
        assert_eq!(ErrorKind::OutOfMemory.errno(), -12);
        assert!(ErrorKind::NotAcquired.errno() < 0);
    }

    #[test]
    fn test_try_reserve_maps_to_oom() {
        let mut v: alloc::vec::Vec<u64> = alloc::vec::Vec::new();
        let err: PfmError = v.try_reserve(usize::MAX).unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }
}
