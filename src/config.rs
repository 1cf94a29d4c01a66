//! Balancer configuration.
//!
//! Provides [`BalancerConfig`] for tuning the backoff, estimator cadence,
//! smoothing, and exploration behaviour. All fields have sensible defaults;
//! set them before [`LoadBalancer::start`](crate::LoadBalancer::start) —
//! the tunables are frozen into the running balancer at that point and
//! later mutation has no effect.

use std::time::Duration;

// ── Default value functions ────────────────────────────────────────────

/// Default cap on the backoff exponent (sleeps plateau at `unit * 2^10`).
fn default_backoff_max_exponent() -> u32 {
    10
}

/// Default base unit of the per-attempt exponential backoff.
fn default_backoff_unit() -> Duration {
    Duration::from_millis(100)
}

/// Default estimator tick period.
fn default_update_interval() -> Duration {
    Duration::from_secs(1)
}

/// Default EMA weight given to the newly observed rate.
fn default_smoothing_factor() -> f64 {
    0.5
}

/// Default probability of a uniform-random pick instead of the WRR pick.
fn default_exploration_rate() -> f64 {
    0.1
}

/// Default additive capacity bump for a tick with at least one success.
fn default_aimd_increase() -> f64 {
    0.1
}

/// Default capacity multiplier for a tick with at least one rejection.
fn default_aimd_decrease_factor() -> f64 {
    0.9
}

// ── BalancerConfig ─────────────────────────────────────────────────────

/// Tunables for a [`LoadBalancer`](crate::LoadBalancer).
///
/// Construct via [`Default`] and override individual fields before calling
/// `start()`.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerConfig {
    /// Caps the per-attempt backoff sleep at `backoff_unit * 2^this`.
    ///
    /// Range: `0..=31`.  Default: `10` (≈102 s with the default unit).
    pub backoff_max_exponent: u32,

    /// Base unit of the exponential backoff applied after a
    /// capacity-exceeded response.  Default: 100 ms.
    pub backoff_unit: Duration,

    /// Tick period of the capacity estimator.  Default: 1 s.
    pub update_interval: Duration,

    /// Weight of the new observation vs. the prior estimate in the
    /// exponential moving average.
    ///
    /// Range: `0.0..=1.0`.  Default: `0.5`.
    pub smoothing_factor: f64,

    /// Probability of picking a handler uniformly at random instead of
    /// following the weighted round-robin (ε-greedy exploration).
    ///
    /// Range: `0.0..=1.0`.  Default: `0.1`.
    pub exploration_rate: f64,

    /// Additive capacity increase applied when a handler completed at
    /// least one call in a tick.  Must be `>= 0`.  Default: `0.1`.
    pub aimd_increase: f64,

    /// Multiplicative capacity decrease applied when a handler rejected at
    /// least one call in a tick.
    ///
    /// Range: `(0.0, 1.0]`.  Default: `0.9`.
    pub aimd_decrease_factor: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            backoff_max_exponent: default_backoff_max_exponent(),
            backoff_unit: default_backoff_unit(),
            update_interval: default_update_interval(),
            smoothing_factor: default_smoothing_factor(),
            exploration_rate: default_exploration_rate(),
            aimd_increase: default_aimd_increase(),
            aimd_decrease_factor: default_aimd_decrease_factor(),
        }
    }
}

/// Validate a [`BalancerConfig`], returning a list of human-readable errors.
///
/// Returns an empty `Vec` on success, or one error string per violated
/// constraint.
pub fn validate(config: &BalancerConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.backoff_max_exponent > 31 {
        errors.push(format!(
            "backoff_max_exponent must be <= 31, got {}",
            config.backoff_max_exponent
        ));
    }

    if config.backoff_unit.is_zero() {
        errors.push("backoff_unit must be non-zero".to_string());
    }

    if config.update_interval.is_zero() {
        errors.push("update_interval must be non-zero".to_string());
    }

    if !(0.0..=1.0).contains(&config.smoothing_factor) {
        errors.push(format!(
            "smoothing_factor must be in [0.0, 1.0], got {}",
            config.smoothing_factor
        ));
    }

    if !(0.0..=1.0).contains(&config.exploration_rate) {
        errors.push(format!(
            "exploration_rate must be in [0.0, 1.0], got {}",
            config.exploration_rate
        ));
    }

    if config.aimd_increase < 0.0 {
        errors.push(format!(
            "aimd_increase must be >= 0, got {}",
            config.aimd_increase
        ));
    }

    if config.aimd_decrease_factor <= 0.0 || config.aimd_decrease_factor > 1.0 {
        errors.push(format!(
            "aimd_decrease_factor must be in (0.0, 1.0], got {}",
            config.aimd_decrease_factor
        ));
    }

    errors
}
