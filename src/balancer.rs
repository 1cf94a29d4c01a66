//! The load balancer itself: selection, dispatch, backoff, lifecycle.
//!
//! ## Responsibility
//! Pick a handler per [`LoadBalancer::dispatch`] call (ε-greedy over the
//! weighted round-robin), invoke it, interpret its result, and record the
//! outcome counters the estimator learns from.
//!
//! ## Guarantees
//! - The balancer mutex is held only while picking an index or publishing
//!   weights, never across a downstream call or a sleep. (The guard is
//!   not `Send`, so holding it across an `.await` does not compile.)
//! - A dispatch retries the *same* handler on capacity-exceeded; switching
//!   handlers mid-call would blur the learning signal. Steering happens
//!   between calls, through the weight vector.
//! - `calls[i]` is incremented exactly once per successful dispatch and
//!   never for cancelled or failed ones.

use crate::capacity::{CapacityTable, TickCounters};
use crate::config::{self, BalancerConfig};
use crate::downstream::{Downstream, Handler};
use crate::estimator::{lock_shared, Estimator, SharedState};
use crate::wrr::WeightedRoundRobin;
use crate::BalancerError;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sleep length for retry `attempt` (0-based): `unit * 2^min(attempt, max)`.
fn backoff_delay(unit: Duration, attempt: u32, max_exponent: u32) -> Duration {
    let exponent = attempt.min(max_exponent).min(31);
    unit.saturating_mul(1u32 << exponent)
}

/// Adaptive weighted round-robin load balancer.
///
/// Dispatches each call to one of a fixed set of downstreams, learning
/// their sustainable rates from successes and capacity-exceeded rejections
/// alone. See the [crate docs](crate) for the control loop.
///
/// ## Usage
///
/// ```no_run
/// use dynlb::{Handler, LoadBalancer, RateLimitedDownstream};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), dynlb::BalancerError> {
/// // Two backends with unknown throughput; hints of 0 mean "no idea".
/// let mut balancer: LoadBalancer<u32, u32> = LoadBalancer::new(vec![
///     Handler::new(0.0, RateLimitedDownstream::new(1)?),
///     Handler::new(0.0, RateLimitedDownstream::new(4)?),
/// ])?;
/// balancer.start()?;
///
/// let ctx = CancellationToken::new();
/// let out = balancer.dispatch(&ctx, 7).await?;
/// assert_eq!(out, 7);
///
/// // The weight vector drifts toward the backends' true rates.
/// println!("weights: {:?}", balancer.weights());
/// balancer.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct LoadBalancer<T, U> {
    /// Tunables. Set before [`start`](Self::start); the running balancer
    /// uses a copy frozen at that point, so later edits are inert.
    pub config: BalancerConfig,

    downstreams: Vec<Arc<dyn Downstream<T, U>>>,
    counters: Arc<TickCounters>,
    state: Arc<Mutex<SharedState>>,
    shutdown_tx: watch::Sender<bool>,
    tick_task: Option<JoinHandle<()>>,
    frozen: Option<BalancerConfig>,
}

impl<T, U> LoadBalancer<T, U> {
    /// Create a balancer over a fixed set of handlers.
    ///
    /// Capacities are seeded from the registration hints and an initial
    /// weight vector is computed immediately, so dispatching before
    /// [`start`](Self::start) already honours the hints (as a static WRR).
    ///
    /// # Errors
    ///
    /// Returns `Err(BalancerError::Config)` if `handlers` is empty.
    pub fn new(handlers: Vec<Handler<T, U>>) -> Result<Self, BalancerError> {
        if handlers.is_empty() {
            return Err(BalancerError::Config(
                "at least one handler is required".into(),
            ));
        }

        let hints: Vec<f64> = handlers.iter().map(|h| h.est_cap).collect();
        let downstreams: Vec<_> = handlers.into_iter().map(|h| h.downstream).collect();

        let caps = CapacityTable::new(&hints);
        let wrr = WeightedRoundRobin::new(caps.weights());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: BalancerConfig::default(),
            counters: Arc::new(TickCounters::new(downstreams.len())),
            downstreams,
            state: Arc::new(Mutex::new(SharedState { caps, wrr })),
            shutdown_tx,
            tick_task: None,
            frozen: None,
        })
    }

    /// Start the periodic weight updates. Without this the balancer is a
    /// static weighted round-robin over the registration hints.
    ///
    /// The current `config` is validated and frozen here.
    ///
    /// # Errors
    ///
    /// Returns `Err(BalancerError::Config)` if already started or if the
    /// config fails validation.
    pub fn start(&mut self) -> Result<(), BalancerError> {
        if self.tick_task.is_some() {
            return Err(BalancerError::Config("balancer already started".into()));
        }
        let problems = config::validate(&self.config);
        if !problems.is_empty() {
            return Err(BalancerError::Config(problems.join("; ")));
        }

        self.frozen = Some(self.config.clone());
        let estimator = Estimator::from_config(&self.config);
        let handle = estimator.spawn(
            Arc::clone(&self.state),
            Arc::clone(&self.counters),
            self.shutdown_tx.subscribe(),
        );
        self.tick_task = Some(handle);
        tracing::debug!(handlers = self.downstreams.len(), "balancer started");
        Ok(())
    }

    /// Signal the estimator task to stop. Never blocks.
    ///
    /// Dispatching is still possible afterwards but the weights are frozen
    /// at their last published values.
    pub fn destroy(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// [`destroy`](Self::destroy), then wait for the estimator task to
    /// finish, for deterministic teardown.
    pub async fn shutdown(&mut self) {
        self.destroy();
        if let Some(handle) = self.tick_task.take() {
            let _ = handle.await;
        }
    }

    /// Snapshot of the current weight vector. Best-effort, for
    /// testing and debugging.
    pub fn weights(&self) -> Vec<u32> {
        lock_shared(&self.state).wrr.weights().to_vec()
    }

    fn effective_config(&self) -> &BalancerConfig {
        self.frozen.as_ref().unwrap_or(&self.config)
    }

    /// Pick the handler for one dispatch: with probability
    /// `exploration_rate` a uniform-random index, otherwise the WRR pick.
    /// Holds the balancer mutex only for the duration of the pick.
    fn select_index(&self) -> usize {
        let config = self.effective_config();
        let slots = self.downstreams.len();
        let mut state = lock_shared(&self.state);
        let mut rng = rand::thread_rng();
        if config.exploration_rate > 0.0 && slots > 1 && rng.gen::<f64>() < config.exploration_rate
        {
            rng.gen_range(0..slots)
        } else {
            state.wrr.next()
        }
    }

    /// Dispatch one unit of work to a learned-weight-chosen handler.
    ///
    /// Capacity-exceeded responses are retried on the same handler with
    /// exponential backoff until the handler accepts or `ctx` is
    /// cancelled; they are never surfaced. Every other outcome (the
    /// output, a cancellation, any other downstream error) is returned
    /// as produced.
    pub async fn dispatch(&self, ctx: &CancellationToken, input: T) -> Result<U, BalancerError>
    where
        T: Clone,
    {
        let index = self.select_index();
        tracing::trace!(index, "dispatching");
        self.try_dispatch(ctx, input, index).await
    }

    async fn try_dispatch(
        &self,
        ctx: &CancellationToken,
        input: T,
        index: usize,
    ) -> Result<U, BalancerError>
    where
        T: Clone,
    {
        let config = self.effective_config();
        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(BalancerError::Cancelled);
            }
            match self.downstreams[index].call(ctx, input.clone()).await {
                Ok(output) => {
                    self.counters.record_call(index);
                    return Ok(output);
                }
                Err(err) if err.is_capacity_exceeded() => {
                    self.counters.record_rejection(index);
                    let delay =
                        backoff_delay(config.backoff_unit, attempt, config.backoff_max_exponent);
                    tracing::debug!(
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "capacity exceeded, backing off"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(BalancerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::FnDownstream;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_balancer(hints: &[f64]) -> LoadBalancer<u32, u32> {
        let handlers = hints
            .iter()
            .map(|&hint| {
                Handler::new(
                    hint,
                    FnDownstream::new(|_ctx: CancellationToken, n: u32| async move { Ok(n) }),
                )
            })
            .collect();
        LoadBalancer::new(handlers).unwrap()
    }

    #[test]
    fn test_empty_handler_list_is_rejected() {
        let result: Result<LoadBalancer<u32, u32>, _> = LoadBalancer::new(vec![]);
        assert!(matches!(result, Err(BalancerError::Config(_))));
    }

    #[test]
    fn test_initial_weights_honour_hints() {
        let balancer = echo_balancer(&[1.0, 5.0, 2.0]);
        assert_eq!(balancer.weights(), vec![12, 62, 25]);
    }

    #[test]
    fn test_backoff_delay_doubles_then_plateaus() {
        let unit = Duration::from_millis(100);
        assert_eq!(backoff_delay(unit, 0, 10), Duration::from_millis(100));
        assert_eq!(backoff_delay(unit, 1, 10), Duration::from_millis(200));
        assert_eq!(backoff_delay(unit, 3, 10), Duration::from_millis(800));
        // Attempts past the cap plateau at unit * 2^10.
        let plateau = Duration::from_millis(100 * 1024);
        assert_eq!(backoff_delay(unit, 10, 10), plateau);
        assert_eq!(backoff_delay(unit, 11, 10), plateau);
        assert_eq!(backoff_delay(unit, 500, 10), plateau);
    }

    #[test]
    fn test_backoff_delay_never_overflows() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 31, 31);
        assert!(delay >= Duration::from_secs(u64::MAX / 2));
    }

    #[test]
    fn test_selection_explores_at_the_configured_rate() {
        let mut balancer = echo_balancer(&[95.0, 5.0]);
        balancer.config.exploration_rate = 0.5;
        assert_eq!(balancer.weights(), vec![95, 5]);

        let draws = 10_000;
        let mut picked_minority = 0u32;
        for _ in 0..draws {
            if balancer.select_index() == 1 {
                picked_minority += 1;
            }
        }
        // 0.5 * 0.05 (WRR share) + 0.5 * 0.5 (uniform) ≈ 0.275.
        let fraction = f64::from(picked_minority) / f64::from(draws);
        assert!(
            (0.25..=0.30).contains(&fraction),
            "minority fraction {fraction} outside [0.25, 0.30]"
        );
    }

    #[test]
    fn test_selection_without_exploration_follows_weights_exactly() {
        let mut balancer = echo_balancer(&[1.0, 1.0]);
        balancer.config.exploration_rate = 0.0;

        let mut counts = [0u32; 2];
        for _ in 0..1000 {
            counts[balancer.select_index()] += 1;
        }
        assert_eq!(counts[0], counts[1]);
    }

    #[test]
    fn test_single_handler_is_always_selected() {
        let mut balancer = echo_balancer(&[3.0]);
        balancer.config.exploration_rate = 0.5;
        for _ in 0..100 {
            assert_eq!(balancer.select_index(), 0);
        }
    }

    #[tokio::test]
    async fn test_successful_dispatch_counts_one_call() {
        let balancer = echo_balancer(&[1.0]);
        let ctx = CancellationToken::new();

        let out = balancer.dispatch(&ctx, 9).await.unwrap();
        assert_eq!(out, 9);
        assert_eq!(balancer.counters.peek(0), (1, 0));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt_touches_nothing() {
        let invocations = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&invocations);
        let balancer: LoadBalancer<u32, u32> = LoadBalancer::new(vec![Handler::new(
            1.0,
            FnDownstream::new(move |_ctx: CancellationToken, n: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(n)
                }
            }),
        )])
        .unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = balancer.dispatch(&ctx, 1).await;
        assert!(matches!(result, Err(BalancerError::Cancelled)));
        assert_eq!(invocations.load(Ordering::Relaxed), 0);
        assert_eq!(balancer.counters.peek(0), (0, 0));
    }

    #[tokio::test]
    async fn test_other_errors_surface_immediately_and_count_nothing() {
        let balancer: LoadBalancer<u32, u32> = LoadBalancer::new(vec![Handler::new(
            1.0,
            FnDownstream::new(|_ctx: CancellationToken, _n: u32| async move {
                Err::<u32, _>(BalancerError::downstream(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "backend reset",
                )))
            }),
        )])
        .unwrap();

        let ctx = CancellationToken::new();
        let err = balancer.dispatch(&ctx, 1).await.unwrap_err();
        assert!(matches!(err, BalancerError::Downstream(_)));
        assert_eq!(err.to_string(), "backend reset");
        assert_eq!(balancer.counters.peek(0), (0, 0));
    }

    #[tokio::test]
    async fn test_capacity_exceeded_retries_same_handler_until_accepted() {
        let rejections_left = Arc::new(AtomicU32::new(2));
        let gate = Arc::clone(&rejections_left);
        let mut balancer: LoadBalancer<u32, u32> = LoadBalancer::new(vec![Handler::new(
            1.0,
            FnDownstream::new(move |_ctx: CancellationToken, n: u32| {
                let gate = Arc::clone(&gate);
                async move {
                    if gate.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                            left.checked_sub(1)
                        })
                        .is_ok()
                    {
                        Err(BalancerError::CapacityExceeded)
                    } else {
                        Ok(n)
                    }
                }
            }),
        )])
        .unwrap();
        balancer.config.backoff_unit = Duration::from_millis(1);

        let ctx = CancellationToken::new();
        let out = balancer.dispatch(&ctx, 5).await.unwrap();
        assert_eq!(out, 5);
        // Two rejections recorded, exactly one success.
        assert_eq!(balancer.counters.peek(0), (1, 2));
    }

    #[tokio::test]
    async fn test_wrapped_capacity_signal_still_triggers_retry() {
        use thiserror::Error;

        #[derive(Error, Debug)]
        #[error("client layer: {source}")]
        struct ClientError {
            #[source]
            source: BalancerError,
        }

        let first = Arc::new(AtomicU32::new(0));
        let gate = Arc::clone(&first);
        let mut balancer: LoadBalancer<u32, u32> = LoadBalancer::new(vec![Handler::new(
            1.0,
            FnDownstream::new(move |_ctx: CancellationToken, n: u32| {
                let gate = Arc::clone(&gate);
                async move {
                    if gate.fetch_add(1, Ordering::Relaxed) == 0 {
                        Err(BalancerError::downstream(ClientError {
                            source: BalancerError::CapacityExceeded,
                        }))
                    } else {
                        Ok(n)
                    }
                }
            }),
        )])
        .unwrap();
        balancer.config.backoff_unit = Duration::from_millis(1);

        let ctx = CancellationToken::new();
        let out = balancer.dispatch(&ctx, 3).await.unwrap();
        assert_eq!(out, 3);
        assert_eq!(balancer.counters.peek(0), (1, 1));
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_returns_promptly() {
        let balancer: Arc<LoadBalancer<u32, u32>> = Arc::new(
            LoadBalancer::new(vec![Handler::new(
                1.0,
                FnDownstream::new(|_ctx: CancellationToken, _n: u32| async move {
                    Err::<u32, _>(BalancerError::CapacityExceeded)
                }),
            )])
            .unwrap(),
        );

        let ctx = CancellationToken::new();
        let dispatch = {
            let balancer = Arc::clone(&balancer);
            let ctx = ctx.clone();
            tokio::spawn(async move { balancer.dispatch(&ctx, 1).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();

        // Must come back within roughly one backoff unit (100 ms default).
        let result = tokio::time::timeout(Duration::from_millis(200), dispatch)
            .await
            .expect("dispatch did not observe cancellation in time")
            .unwrap();
        assert!(matches!(result, Err(BalancerError::Cancelled)));
        let (calls, rejections) = balancer.counters.peek(0);
        assert_eq!(calls, 0);
        assert!(rejections >= 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let mut balancer = echo_balancer(&[1.0]);
        balancer.start().unwrap();
        assert!(matches!(
            balancer.start(),
            Err(BalancerError::Config(_))
        ));
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_validates_config() {
        let mut balancer = echo_balancer(&[1.0]);
        balancer.config.smoothing_factor = 7.0;
        let err = balancer.start().unwrap_err();
        assert!(err.to_string().contains("smoothing_factor"));
    }

    #[tokio::test]
    async fn test_config_is_frozen_at_start() {
        let mut balancer = echo_balancer(&[1.0, 1.0]);
        balancer.config.exploration_rate = 0.0;
        balancer.start().unwrap();

        // Post-start edits must not reach the running balancer.
        balancer.config.exploration_rate = 1.0;
        assert_eq!(balancer.effective_config().exploration_rate, 0.0);
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_joins_the_estimator_task() {
        let mut balancer = echo_balancer(&[1.0]);
        balancer.config.update_interval = Duration::from_millis(20);
        balancer.start().unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), balancer.shutdown()).await;
        assert!(joined.is_ok(), "shutdown did not complete");
        assert!(balancer.tick_task.is_none());
    }

    #[tokio::test]
    async fn test_destroy_never_blocks_without_start() {
        let balancer = echo_balancer(&[1.0]);
        balancer.destroy();
        balancer.destroy();
    }

    #[tokio::test]
    async fn test_dispatch_works_after_destroy_as_static_wrr() {
        let mut balancer = echo_balancer(&[1.0, 1.0]);
        balancer.config.exploration_rate = 0.0;
        balancer.config.update_interval = Duration::from_millis(20);
        balancer.start().unwrap();
        balancer.shutdown().await;

        let ctx = CancellationToken::new();
        for i in 0..10 {
            assert_eq!(balancer.dispatch(&ctx, i).await.unwrap(), i);
        }
    }
}
