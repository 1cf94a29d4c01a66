//! Downstream handler abstraction and bundled implementations.
//!
//! A downstream is an opaque unit of work the balancer dispatches to: it
//! either completes, signals backpressure with
//! [`BalancerError::CapacityExceeded`], or fails with any other error.
//! The balancer never inspects inputs or outputs.
//!
//! Two rate-limited downstreams ship with the crate, one that waits for
//! quota and one that sheds load. They are handy as demo backends and as
//! fixtures for convergence tests.
//!
//! ## Usage
//!
//! ```no_run
//! use dynlb::{FnDownstream, Handler};
//! use tokio_util::sync::CancellationToken;
//!
//! let handler: Handler<u32, u32> = Handler::new(
//!     2.0, // estimated capacity hint, tasks/sec
//!     FnDownstream::new(|_ctx: CancellationToken, n: u32| async move { Ok(n * 2) }),
//! );
//! ```

use crate::BalancerError;
use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A dispatch target with finite, unknown throughput.
///
/// Implementations must be thread-safe (`Send + Sync`); the balancer calls
/// them concurrently from many tasks without serialisation. The trait is
/// object-safe and consumed as `Arc<dyn Downstream<T, U>>`.
///
/// Return [`BalancerError::CapacityExceeded`] to tell the balancer the
/// call arrived over quota; it will back off and retry, and the rejection
/// steers future traffic away. Any other error is handed to the caller
/// verbatim and does not feed the learning loop. Honour `ctx` where the
/// work is interruptible.
#[async_trait]
pub trait Downstream<T, U>: Send + Sync {
    async fn call(&self, ctx: &CancellationToken, input: T) -> Result<U, BalancerError>;
}

/// Adapter lifting an async closure into [`Downstream`].
pub struct FnDownstream<F> {
    f: F,
}

impl<F> FnDownstream<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, U, F, Fut> Downstream<T, U> for FnDownstream<F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<U, BalancerError>> + Send,
{
    async fn call(&self, ctx: &CancellationToken, input: T) -> Result<U, BalancerError> {
        (self.f)(ctx.clone(), input).await
    }
}

/// Registration record pairing a downstream with its capacity hint.
///
/// `est_cap` is the caller's guess at the handler's sustainable rate in
/// tasks/sec. Zero is fine — the estimator learns the real rate; the hint
/// only shapes the very first dispatches.
pub struct Handler<T, U> {
    pub est_cap: f64,
    pub downstream: Arc<dyn Downstream<T, U>>,
}

impl<T, U> Handler<T, U> {
    pub fn new(est_cap: f64, downstream: impl Downstream<T, U> + 'static) -> Self {
        Self {
            est_cap,
            downstream: Arc::new(downstream),
        }
    }

    /// Register an already-shared downstream.
    pub fn from_arc(est_cap: f64, downstream: Arc<dyn Downstream<T, U>>) -> Self {
        Self { est_cap, downstream }
    }
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn per_second_quota(rate: u32) -> Result<Quota, BalancerError> {
    let rate = NonZeroU32::new(rate)
        .ok_or_else(|| BalancerError::Config("rate must be > 0 tasks/sec".into()))?;
    // Burst of one: permits drip out evenly instead of front-loading.
    Ok(Quota::per_second(rate).allow_burst(NonZeroU32::MIN))
}

/// Echo downstream throttled by a blocking rate limiter: calls over quota
/// wait for a permit instead of failing. From the balancer's point of view
/// it never rejects, it just completes at its true rate.
pub struct RateLimitedDownstream {
    limiter: DirectRateLimiter,
}

impl RateLimitedDownstream {
    /// Create a downstream that completes at most `rate` calls per second.
    ///
    /// # Errors
    ///
    /// Returns `Err(BalancerError::Config)` if `rate` is zero.
    pub fn new(rate: u32) -> Result<Self, BalancerError> {
        Ok(Self {
            limiter: RateLimiter::direct(per_second_quota(rate)?),
        })
    }
}

#[async_trait]
impl<T> Downstream<T, T> for RateLimitedDownstream
where
    T: Send + 'static,
{
    async fn call(&self, ctx: &CancellationToken, input: T) -> Result<T, BalancerError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(BalancerError::Cancelled),
            _ = self.limiter.until_ready() => Ok(input),
        }
    }
}

/// Echo downstream throttled by a shedding rate limiter: calls over quota
/// fail immediately with [`BalancerError::CapacityExceeded`] (the shape of
/// most public APIs).
pub struct LoadSheddingDownstream {
    limiter: DirectRateLimiter,
}

impl LoadSheddingDownstream {
    /// Create a downstream that serves at most `rate` calls per second and
    /// sheds the rest.
    ///
    /// # Errors
    ///
    /// Returns `Err(BalancerError::Config)` if `rate` is zero.
    pub fn new(rate: u32) -> Result<Self, BalancerError> {
        Ok(Self {
            limiter: RateLimiter::direct(per_second_quota(rate)?),
        })
    }
}

#[async_trait]
impl<T> Downstream<T, T> for LoadSheddingDownstream
where
    T: Send + 'static,
{
    async fn call(&self, _ctx: &CancellationToken, input: T) -> Result<T, BalancerError> {
        match self.limiter.check() {
            Ok(_) => Ok(input),
            Err(_) => Err(BalancerError::CapacityExceeded),
        }
    }
}
