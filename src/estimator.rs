//! Capacity estimator and its control loop.
//!
//! ## Responsibility
//! Fold each tick's observed successes and rejections into the capacity
//! table (AIMD + exponential smoothing + idle decay) and republish the
//! weight vector into the selector.
//!
//! ## Guarantees
//! - A single background task per balancer; the tick update runs under the
//!   balancer mutex and never awaits while holding it.
//! - Stops on the shutdown signal or when the balancer is dropped (the
//!   watch sender closing counts as shutdown).
//!
//! ## NOT Responsible For
//! - Selecting handlers or counting outcomes (see: balancer.rs)
//! - The weight derivation itself (see: capacity.rs)

use crate::capacity::{CapacityTable, TickCounters};
use crate::config::BalancerConfig;
use crate::wrr::WeightedRoundRobin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Multiplier applied to a handler that saw no traffic at all in a tick.
/// Without it a stale high estimate would starve the other handlers.
const IDLE_DECAY: f64 = 0.99;

/// The state guarded by the balancer mutex: capacity estimates plus the
/// selector they feed.
pub(crate) struct SharedState {
    pub(crate) caps: CapacityTable,
    pub(crate) wrr: WeightedRoundRobin,
}

/// Lock the shared state, recovering the guard if a panicking holder
/// poisoned the mutex (the state is valid after every stored write).
pub(crate) fn lock_shared(state: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic capacity estimator. Holds a frozen copy of the tunables taken
/// at [`LoadBalancer::start`](crate::LoadBalancer::start).
pub(crate) struct Estimator {
    update_interval: Duration,
    smoothing_factor: f64,
    aimd_increase: f64,
    aimd_decrease_factor: f64,
}

impl Estimator {
    pub(crate) fn from_config(config: &BalancerConfig) -> Self {
        Self {
            update_interval: config.update_interval,
            smoothing_factor: config.smoothing_factor,
            aimd_increase: config.aimd_increase,
            aimd_decrease_factor: config.aimd_decrease_factor,
        }
    }

    /// Fold one tick's counters into the capacity table.
    ///
    /// Per handler: additive increase if it completed anything,
    /// multiplicative decrease if it rejected anything, then an EMA pull
    /// toward the observed completion rate; handlers with no traffic decay
    /// instead. Every estimate is clamped to [`MIN_CAPACITY`] and the
    /// counters are left at zero for the next window.
    pub(crate) fn fold_tick(&self, caps: &mut CapacityTable, counters: &TickCounters) {
        let interval_secs = self.update_interval.as_secs_f64();

        for index in 0..counters.len() {
            let (calls, rejections) = counters.take(index);
            let mut cap = caps.get(index);

            if calls > 0 {
                cap += self.aimd_increase;
            }
            if rejections > 0 {
                cap *= self.aimd_decrease_factor;
            }

            if calls > 0 || rejections > 0 {
                let observed = f64::from(calls) / interval_secs;
                cap = self.smoothing_factor * observed + (1.0 - self.smoothing_factor) * cap;
            } else {
                cap *= IDLE_DECAY;
            }

            caps.set(index, cap);
        }
    }

    /// Spawn the tick loop. Each tick folds the counters and republishes
    /// the weight vector; the loop exits when `shutdown` signals or its
    /// sender is dropped.
    pub(crate) fn spawn(
        self,
        state: Arc<Mutex<SharedState>>,
        counters: Arc<TickCounters>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            // interval() fires immediately on the first tick, which would
            // idle-decay every capacity at t=0; start one period out.
            let period = self.update_interval;
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let weights = {
                            let mut shared = lock_shared(&state);
                            self.fold_tick(&mut shared.caps, &counters);
                            let weights = shared.caps.weights();
                            shared.wrr.update_weights(weights.clone());
                            weights
                        };
                        tracing::debug!(weights = ?weights, "capacity weights updated");
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("estimator stopping");
                        break;
                    }
                }
            }
        })
    }
}
