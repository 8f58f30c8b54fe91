//! Process-wide counters for repair cycles.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] logs them all as
//! one `info!` event, typically when a binary shuts down.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cycles_started: AtomicU64,
    cycles_finished: AtomicU64,
    actions_succeeded: AtomicU64,
    actions_failed: AtomicU64,
    actions_skipped: AtomicU64,
    auto_approvals: AtomicU64,
    signals_ignored: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_started: AtomicU64::new(0),
            cycles_finished: AtomicU64::new(0),
            actions_succeeded: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            actions_skipped: AtomicU64::new(0),
            auto_approvals: AtomicU64::new(0),
            signals_ignored: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cycles_started", "counter incremented");
    }

    pub fn inc_cycles_finished(&self) {
        self.cycles_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cycles_finished", "counter incremented");
    }

    /// Count one resolved action under its outcome label.
    pub fn inc_action(&self, label: &str) {
        let counter = match label {
            "succeeded" => &self.actions_succeeded,
            "failed" => &self.actions_failed,
            "skipped" => &self.actions_skipped,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "actions", outcome = label, "counter incremented");
    }

    pub fn inc_auto_approvals(&self) {
        self.auto_approvals.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "auto_approvals", "counter incremented");
    }

    pub fn inc_signals_ignored(&self) {
        self.signals_ignored.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "signals_ignored", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cycles_started = self.cycles_started(),
            cycles_finished = self.cycles_finished(),
            actions_succeeded = self.actions_succeeded(),
            actions_failed = self.actions_failed(),
            actions_skipped = self.actions_skipped(),
            auto_approvals = self.auto_approvals(),
            signals_ignored = self.signals_ignored(),
        );
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn cycles_finished(&self) -> u64 {
        self.cycles_finished.load(Ordering::Relaxed)
    }

    pub fn actions_succeeded(&self) -> u64 {
        self.actions_succeeded.load(Ordering::Relaxed)
    }

    pub fn actions_failed(&self) -> u64 {
        self.actions_failed.load(Ordering::Relaxed)
    }

    pub fn actions_skipped(&self) -> u64 {
        self.actions_skipped.load(Ordering::Relaxed)
    }

    pub fn auto_approvals(&self) -> u64 {
        self.auto_approvals.load(Ordering::Relaxed)
    }

    pub fn signals_ignored(&self) -> u64 {
        self.signals_ignored.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.cycles_started,
            &self.cycles_finished,
            &self.actions_succeeded,
            &self.actions_failed,
            &self.actions_skipped,
            &self.auto_approvals,
            &self.signals_ignored,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_cycles_started();
        m.inc_cycles_started();
        m.inc_cycles_finished();
        assert_eq!(m.cycles_started(), 2);
        assert_eq!(m.cycles_finished(), 1);

        m.inc_action("succeeded");
        m.inc_action("failed");
        m.inc_action("skipped");
        m.inc_action("skipped");
        m.inc_action("pending");
        assert_eq!(m.actions_succeeded(), 1);
        assert_eq!(m.actions_failed(), 1);
        assert_eq!(m.actions_skipped(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_auto_approvals();
        m.inc_signals_ignored();
        m.reset();
        assert_eq!(m.auto_approvals(), 0);
        assert_eq!(m.signals_ignored(), 0);
    }
}
