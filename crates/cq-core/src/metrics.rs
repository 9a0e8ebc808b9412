//! Process-wide counters for the commit queue.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`] at the end of every round.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free atomic counters.
pub struct Metrics {
    rounds: AtomicU64,
    verifications_dispatched: AtomicU64,
    commits: AtomicU64,
    discards: AtomicU64,
    failures_reported: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rounds: AtomicU64::new(0),
            verifications_dispatched: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            failures_reported: AtomicU64::new(0),
        }
    }

    pub fn inc_rounds(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rounds", "counter incremented");
    }

    /// Count `n` verification tasks handed to the pool.
    pub fn add_verifications_dispatched(&self, n: u64) {
        self.verifications_dispatched.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "verifications_dispatched", n, "counter incremented");
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits", "counter incremented");
    }

    pub fn inc_discards(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "discards", "counter incremented");
    }

    pub fn inc_failures_reported(&self) {
        self.failures_reported.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "failures_reported", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rounds = self.rounds(),
            verifications_dispatched = self.verifications_dispatched(),
            commits = self.commits(),
            discards = self.discards(),
            failures_reported = self.failures_reported(),
        );
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn verifications_dispatched(&self) -> u64 {
        self.verifications_dispatched.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    pub fn failures_reported(&self) -> u64 {
        self.failures_reported.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.rounds.store(0, Ordering::Relaxed);
        self.verifications_dispatched.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.discards.store(0, Ordering::Relaxed);
        self.failures_reported.store(0, Ordering::Relaxed);
    }
}
