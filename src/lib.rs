//! # dynlb
//!
//! An adaptive weighted round-robin load balancer over Tokio.
//!
//! Given a set of downstream handlers whose true throughput is unknown (and
//! may drift), the balancer dispatches one handler per call and learns each
//! handler's sustainable rate purely from its return values: completions
//! count as successes, the [`BalancerError::CapacityExceeded`] sentinel
//! counts as backpressure. No out-of-band measurement is involved.
//!
//! ## Architecture
//!
//! ```text
//! dispatch ──→ ε-greedy / WRR select ──→ downstream call
//!                      ▲                       │
//!               weight vector         calls / rejections (atomics)
//!                      │                       ▼
//!              estimator tick: AIMD + smoothing + idle decay
//! ```
//!
//! The estimator runs as a single background task started by
//! [`LoadBalancer::start`]. Each tick it folds the per-handler counters into
//! the capacity estimates and republishes the weight vector the selector
//! draws from.

use thiserror::Error;

pub mod balancer;
mod capacity;
pub mod config;
pub mod downstream;
mod estimator;
pub mod wrr;

// Re-exports
pub use balancer::LoadBalancer;
pub use config::BalancerConfig;
pub use downstream::{
    Downstream, FnDownstream, Handler, LoadSheddingDownstream, RateLimitedDownstream,
};
pub use wrr::WeightedRoundRobin;

/// Errors produced by the balancer and its downstreams.
#[derive(Error, Debug)]
pub enum BalancerError {
    /// The distinguished backpressure signal. Downstreams return this to
    /// tell the balancer they were called faster than they can serve; the
    /// balancer reacts by backing off and retrying, and the rejection feeds
    /// the capacity estimate. It is never surfaced to callers of
    /// [`LoadBalancer::dispatch`] unless cancellation fires first.
    #[error("downstream capacity exceeded")]
    CapacityExceeded,

    /// The dispatch was cancelled through its [`CancellationToken`]
    /// before a downstream produced a result.
    ///
    /// [`CancellationToken`]: tokio_util::sync::CancellationToken
    #[error("dispatch cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    /// Any other downstream failure, surfaced to the caller verbatim.
    #[error(transparent)]
    Downstream(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl BalancerError {
    /// Wrap an arbitrary downstream failure.
    pub fn downstream(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Downstream(Box::new(err))
    }

    /// Return `true` if this error is the capacity-exceeded sentinel,
    /// either directly or anywhere in a wrapped error's source chain.
    pub fn is_capacity_exceeded(&self) -> bool {
        match self {
            Self::CapacityExceeded => true,
            Self::Downstream(boxed) => {
                let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&**boxed);
                while let Some(err) = cause {
                    if matches!(
                        err.downcast_ref::<BalancerError>(),
                        Some(BalancerError::CapacityExceeded)
                    ) {
                        return true;
                    }
                    cause = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
