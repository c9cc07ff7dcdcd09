//! Shared metrics — atomic counters for observability.
//!
//! Wrapped in `Arc<Metrics>` and passed to the pool and admin surface.
//! No external crate needed — we format Prometheus exposition text manually.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared metrics counters, all lock-free via AtomicU64.
pub struct Metrics {
    // ─── Acquirer ────────────────────────────────────────────────────────
    pub pool_gets: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_misses: AtomicU64,
    pub pool_busy_waits: AtomicU64,
    pub containers_created: AtomicU64,
    pub create_failures: AtomicU64,
    pub init_failures: AtomicU64,

    // ─── Releaser ────────────────────────────────────────────────────────
    pub pool_put_backs: AtomicU64,
    pub pool_deletes: AtomicU64,
    pub invariant_violations: AtomicU64,

    // ─── Reclamation ─────────────────────────────────────────────────────
    pub evictions_capacity: AtomicU64,
    pub evictions_age: AtomicU64,
    pub teardowns: AtomicU64,
    pub teardown_failures: AtomicU64,
    pub stragglers_killed: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance with zeroed counters.
    pub fn new() -> Self {
        Self {
            pool_gets: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            pool_busy_waits: AtomicU64::new(0),
            containers_created: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
            init_failures: AtomicU64::new(0),
            pool_put_backs: AtomicU64::new(0),
            pool_deletes: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            evictions_capacity: AtomicU64::new(0),
            evictions_age: AtomicU64::new(0),
            teardowns: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
            stragglers_killed: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1 and return the previous value.
    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
