//! Global atomic counters for agent observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    executions: AtomicU64,
    compile_errors: AtomicU64,
    security_rejections: AtomicU64,
    execution_errors: AtomicU64,
    model_calls: AtomicU64,
    delegations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            compile_errors: AtomicU64::new(0),
            security_rejections: AtomicU64::new(0),
            execution_errors: AtomicU64::new(0),
            model_calls: AtomicU64::new(0),
            delegations: AtomicU64::new(0),
        }
    }

    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    pub fn inc_compile_errors(&self) {
        self.compile_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compile_errors", "counter incremented");
    }

    pub fn inc_security_rejections(&self) {
        self.security_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "security_rejections", "counter incremented");
    }

    pub fn inc_execution_errors(&self) {
        self.execution_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "execution_errors", "counter incremented");
    }

    pub fn inc_model_calls(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_calls", "counter incremented");
    }

    pub fn inc_delegations(&self) {
        self.delegations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "delegations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run) rather than on every
    /// increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions = self.executions(),
            compile_errors = self.compile_errors(),
            security_rejections = self.security_rejections(),
            execution_errors = self.execution_errors(),
            model_calls = self.model_calls(),
            delegations = self.delegations(),
        );
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn compile_errors(&self) -> u64 {
        self.compile_errors.load(Ordering::Relaxed)
    }

    pub fn security_rejections(&self) -> u64 {
        self.security_rejections.load(Ordering::Relaxed)
    }

    pub fn execution_errors(&self) -> u64 {
        self.execution_errors.load(Ordering::Relaxed)
    }

    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }

    pub fn delegations(&self) -> u64 {
        self.delegations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.executions,
            &self.compile_errors,
            &self.security_rejections,
            &self.execution_errors,
            &self.model_calls,
            &self.delegations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.executions(), 0);
        m.inc_executions();
        m.inc_executions();
        assert_eq!(m.executions(), 2);

        m.inc_compile_errors();
        m.inc_security_rejections();
        m.inc_execution_errors();
        m.inc_model_calls();
        m.inc_delegations();
        assert_eq!(m.compile_errors(), 1);
        assert_eq!(m.security_rejections(), 1);
        assert_eq!(m.execution_errors(), 1);
        assert_eq!(m.model_calls(), 1);
        assert_eq!(m.delegations(), 1);
    }

    #[test]
    fn test_reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_executions();
        m.inc_model_calls();
        m.reset();
        assert_eq!(m.executions(), 0);
        assert_eq!(m.model_calls(), 0);
    }
}
