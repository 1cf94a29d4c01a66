//! Per-handler capacity estimates and tick counters.
//!
//! [`TickCounters`] is the lock-free half: dispatcher tasks bump the
//! success/rejection counters concurrently and the estimator drains them
//! once per tick. [`CapacityTable`] is the mutex-guarded half: capacity
//! estimates in tasks/sec, convertible to the integer weight vector the
//! selector consumes.

use std::sync::atomic::{AtomicU32, Ordering};

/// Floor for every capacity estimate. Keeps `total_cap` positive and lets
/// a throttled handler recover instead of being starved forever.
pub(crate) const MIN_CAPACITY: f64 = 0.1;

/// Per-handler success and rejection counters for the current tick window.
pub(crate) struct TickCounters {
    calls: Vec<AtomicU32>,
    rejections: Vec<AtomicU32>,
}

impl TickCounters {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            calls: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            rejections: (0..slots).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Record one successful completion on `index`.
    pub(crate) fn record_call(&self, index: usize) {
        self.calls[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Record one capacity-exceeded rejection on `index`.
    pub(crate) fn record_rejection(&self, index: usize) {
        self.rejections[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the counters for `index`, returning `(calls, rejections)` and
    /// resetting both to zero in one atomic step each. Increments landing
    /// after the swap belong to the next tick window.
    pub(crate) fn take(&self, index: usize) -> (u32, u32) {
        (
            self.calls[index].swap(0, Ordering::Relaxed),
            self.rejections[index].swap(0, Ordering::Relaxed),
        )
    }

    /// Non-destructive read of `(calls, rejections)` for `index`.
    #[cfg(test)]
    pub(crate) fn peek(&self, index: usize) -> (u32, u32) {
        (
            self.calls[index].load(Ordering::Relaxed),
            self.rejections[index].load(Ordering::Relaxed),
        )
    }
}

/// Capacity estimates in tasks/sec, one entry per handler.
///
/// Guarded by the balancer mutex; only the estimator mutates it after
/// construction.
pub(crate) struct CapacityTable {
    caps: Vec<f64>,
}

impl CapacityTable {
    /// Seed the table from registration hints. Hints below 1 task/sec
    /// (including the common "no idea, pass 0") are raised to 1 so every
    /// handler gets a meaningful share of the first dispatches.
    pub(crate) fn new(hints: &[f64]) -> Self {
        Self {
            caps: hints.iter().map(|hint| hint.max(1.0)).collect(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> f64 {
        self.caps[index]
    }

    /// Store a new estimate, clamped to [`MIN_CAPACITY`].
    pub(crate) fn set(&mut self, index: usize, cap: f64) {
        self.caps[index] = cap.max(MIN_CAPACITY);
    }

    /// Derive the integer weight vector: `floor(cap / total_cap * 100)`
    /// per handler. `total_cap` is recomputed here on every call, never
    /// cached. The floor means the weights may sum to slightly under 100;
    /// the selector tolerates that.
    pub(crate) fn weights(&self) -> Vec<u32> {
        let total: f64 = self.caps.iter().sum();
        self.caps
            .iter()
            .map(|cap| (cap / total * 100.0) as u32)
            .collect()
    }
}
