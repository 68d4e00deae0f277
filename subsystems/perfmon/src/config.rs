//! # Perfmon Configuration

use crate::bitmap::CpuMask;
use crate::error::{PfmError, PfmResult};

/// Default switch-timer resolution (1ms)
pub const DEFAULT_TIMER_RESOLUTION_NS: u64 = 1_000_000;

/// Default maximum number of event sets per context
pub const DEFAULT_MAX_SETS: usize = 64;

/// Subsystem configuration, fixed at registration time
#[derive(Debug, Clone)]
pub struct PerfmonConfig {
    /// Number of processors
    pub nr_cpus: usize,
    /// Leave folded register state in hardware on switch-out and resolve
    /// it lazily on the next switch-in (uniprocessor mode)
    pub lazy_save: bool,
    /// Switch timer resolution; set timeouts are rounded up to it
    pub timer_resolution_ns: u64,
    /// Maximum number of event sets a single context may hold
    pub max_sets: usize,
}

impl PerfmonConfig {
    /// Configuration for `nr_cpus` processors
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            lazy_save: nr_cpus == 1,
            timer_resolution_ns: DEFAULT_TIMER_RESOLUTION_NS,
            max_sets: DEFAULT_MAX_SETS,
        }
    }

    /// Override lazy-save mode
    pub fn with_lazy_save(mut self, lazy: bool) -> Self {
        self.lazy_save = lazy;
        self
    }

    /// Override timer resolution
    pub fn with_timer_resolution(mut self, ns: u64) -> Self {
        self.timer_resolution_ns = ns;
        self
    }

    /// Override the per-context set limit
    pub fn with_max_sets(mut self, max: usize) -> Self {
        self.max_sets = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> PfmResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus > CpuMask::CAPACITY {
            return Err(PfmError::invalid_argument("processor count out of range"));
        }
        if self.timer_resolution_ns == 0 {
            return Err(PfmError::invalid_argument("timer resolution must be non-zero"));
        }
        if self.max_sets == 0 {
            return Err(PfmError::invalid_argument("at least one event set is required"));
        }
        Ok(())
    }

    /// Round a timeout up to the timer resolution
    pub fn round_timeout(&self, ns: u64) -> u64 {
        let res = self.timer_resolution_ns;
        ns.div_ceil(res).saturating_mul(res).max(res)
    }
}

impl Default for PerfmonConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PerfmonConfig::default();
        assert!(cfg.lazy_save);
        assert!(!PerfmonConfig::new(4).lazy_save);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PerfmonConfig::new(0).validate().is_err());
        assert!(PerfmonConfig::new(1).with_timer_resolution(0).validate().is_err());
        assert!(PerfmonConfig::new(1).with_max_sets(0).validate().is_err());
    }

    #[test]
    fn test_round_timeout() {
        let cfg = PerfmonConfig::new(1).with_timer_resolution(1000);
        assert_eq!(cfg.round_timeout(1), 1000);
        assert_eq!(cfg.round_timeout(1000), 1000);
        assert_eq!(cfg.round_timeout(1001), 2000);
        assert_eq!(cfg.round_timeout(0), 1000);
    }
}
