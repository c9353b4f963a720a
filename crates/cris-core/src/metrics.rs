//! Global atomic counters for the command pipeline.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    commands_received: AtomicU64,
    validation_failures: AtomicU64,
    execution_failures: AtomicU64,
    deferred_executed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commands_received: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            deferred_executed: AtomicU64::new(0),
        }
    }

    pub fn inc_commands_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commands_received", "counter incremented");
    }

    pub fn inc_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validation_failures", "counter incremented");
    }

    pub fn inc_execution_failures(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "execution_failures", "counter incremented");
    }

    pub fn inc_deferred_executed(&self) {
        self.deferred_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deferred_executed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commands_received = self.commands_received(),
            validation_failures = self.validation_failures(),
            execution_failures = self.execution_failures(),
            deferred_executed = self.deferred_executed(),
        );
    }

    pub fn commands_received(&self) -> u64 {
        self.commands_received.load(Ordering::Relaxed)
    }

    pub fn validation_failures(&self) -> u64 {
        self.validation_failures.load(Ordering::Relaxed)
    }

    pub fn execution_failures(&self) -> u64 {
        self.execution_failures.load(Ordering::Relaxed)
    }

    pub fn deferred_executed(&self) -> u64 {
        self.deferred_executed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.commands_received.store(0, Ordering::Relaxed);
        self.validation_failures.store(0, Ordering::Relaxed);
        self.execution_failures.store(0, Ordering::Relaxed);
        self.deferred_executed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_commands_received();
        m.inc_commands_received();
        m.inc_validation_failures();
        m.inc_deferred_executed();
        assert_eq!(m.commands_received(), 2);
        assert_eq!(m.validation_failures(), 1);
        assert_eq!(m.execution_failures(), 0);
        assert_eq!(m.deferred_executed(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_commands_received();
        m.inc_execution_failures();
        m.reset();
        assert_eq!(m.commands_received(), 0);
        assert_eq!(m.execution_failures(), 0);
    }
}
