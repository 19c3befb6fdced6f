use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pipelinekit_core::{
    Admission, Bulkhead, CircuitBreaker,
    backpressure::BackpressureRegulator,
    circuit_breaker::BreakerState,
    config::ResilienceConfig,
    retry::{RetryController, RetryError},
    timeout::TimeoutController,
};
use pipelinekit_types::{Command, Context, EventSink, MetricsSink, NoopEventSink, NoopMetricsSink, PipelineError};

use crate::chain::MiddlewareChain;
use crate::handler::Handler;
use crate::middleware::Middleware;

/// A snapshot of admission-control headroom, for health checks and metrics
/// scrapers. Diagnostic only, per the same caveat as the underlying
/// components' `available()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityStats {
    pub max_concurrency: Option<usize>,
    pub max_outstanding: Option<usize>,
    pub active: usize,
    pub queued: usize,
    /// `active / max_concurrency`, or `0.0` if backpressure isn't
    /// configured.
    pub utilization: f64,
}

type ChainEntry = Arc<dyn Any + Send + Sync>;

/// Composes the per-command middleware chains with the shared resilience
/// layer (backpressure, circuit breaker, timeout, retry, bulkhead) into a
/// single entry point. One `Dispatcher` typically serves a whole process;
/// each command type registers its own handler and middleware, but all of
/// them share the same admission control and breaker, per spec §4.9.
pub struct Dispatcher {
    chains: RwLock<HashMap<TypeId, ChainEntry>>,
    backpressure: Option<BackpressureRegulator>,
    circuit_breaker: Option<CircuitBreaker>,
    timeout: Option<TimeoutController>,
    retry: Option<RetryController>,
    bulkhead: Option<Bulkhead>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(resilience: ResilienceConfig, events: Arc<dyn EventSink>, metrics: Arc<dyn MetricsSink>) -> Self {
        let backpressure = resilience.backpressure.map(|(concurrency, outstanding, strategy)| {
            BackpressureRegulator::new(concurrency, outstanding, strategy, events.clone())
        });
        let circuit_breaker = resilience
            .circuit_breaker
            .map(|config| CircuitBreaker::new(config, events.clone()));
        let timeout = resilience
            .timeout
            .map(|config| TimeoutController::new(config, events.clone()));
        let retry = resilience
            .retry
            .map(|config| RetryController::new(config, events.clone()));
        let bulkhead = resilience
            .bulkhead
            .map(|config| Bulkhead::new(config, events.clone()));

        Self {
            chains: RwLock::new(HashMap::new()),
            backpressure,
            circuit_breaker,
            timeout,
            retry,
            bulkhead,
            events,
            metrics,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            ResilienceConfig::default(),
            Arc::new(NoopEventSink),
            Arc::new(NoopMetricsSink),
        )
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Register `C`'s handler, replacing any prior registration for the
    /// same command type.
    pub fn register<C: Command>(&self, handler: Arc<dyn Handler<C>>) {
        let chain: ChainEntry = Arc::new(RwLock::new(MiddlewareChain::<C>::new(handler)));
        self.chains.write().insert(TypeId::of::<C>(), chain);
    }

    /// Add a middleware to `C`'s chain. Fails with `NoHandler` if `C` has
    /// not been registered yet.
    pub fn add_middleware<C: Command>(
        &self,
        middleware: Arc<dyn Middleware<C>>,
    ) -> Result<(), PipelineError> {
        let chain = self.chain_for::<C>()?;
        chain
            .downcast_arc::<C>()
            .write()
            .add_middleware(middleware);
        Ok(())
    }

    fn chain_for<C: Command>(&self) -> Result<ChainEntry, PipelineError> {
        self.chains
            .read()
            .get(&TypeId::of::<C>())
            .cloned()
            .ok_or(PipelineError::NoHandler)
    }

    pub fn breaker_state(&self) -> Option<BreakerState> {
        self.circuit_breaker.as_ref().map(|cb| cb.state())
    }

    pub fn capacity_stats(&self) -> CapacityStats {
        match &self.backpressure {
            Some(regulator) => {
                let stats = regulator.stats();
                let max_concurrency = regulator.concurrency_bound();
                let utilization = if max_concurrency == 0 {
                    0.0
                } else {
                    stats.active as f64 / max_concurrency as f64
                };
                CapacityStats {
                    max_concurrency: Some(max_concurrency),
                    max_outstanding: Some(regulator.outstanding_bound()),
                    active: stats.active,
                    queued: stats.queued,
                    utilization,
                }
            }
            None => CapacityStats::default(),
        }
    }

    /// Run `cmd` through admission control, the circuit breaker, the
    /// timeout, and `C`'s middleware chain, retrying the whole
    /// breaker+timeout+chain attempt if a retry policy is configured.
    pub async fn execute<C>(&self, cmd: C, ctx: Context) -> Result<C::Output, PipelineError>
    where
        C: Command + Clone,
    {
        let chain_entry = self.chain_for::<C>()?;
        let chain = chain_entry.downcast_arc::<C>();

        let _bulkhead_permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.admit().await.map_err(PipelineError::from)? {
                Admission::Granted(permit) => Some(permit),
                Admission::Substituted(value) => {
                    return value.downcast::<C::Output>().map(|v| *v).map_err(|_| {
                        PipelineError::TypeMismatch {
                            expected: std::any::type_name::<C::Output>(),
                        }
                    });
                }
            },
            None => None,
        };
        let _backpressure_permit = match &self.backpressure {
            Some(regulator) => Some(regulator.admit().await?),
            None => None,
        };

        // Resolved once from the original command rather than per retry
        // attempt: `cmd` is about to be moved into the retry closure, and
        // `resolve_deadline` only needs to run before that happens.
        let deadline = self
            .timeout
            .as_ref()
            .map(|controller| controller.resolve_deadline(&cmd));

        match &self.retry {
            Some(retry) => {
                let result = retry
                    .run(|_attempt| {
                        let cmd = cmd.clone();
                        let ctx = ctx.clone();
                        let chain = chain.clone();
                        async move { self.attempt(&chain, cmd, ctx, deadline).await }
                    })
                    .await;
                match result {
                    Ok(value) => Ok(value),
                    Err(RetryError::Exhausted { last_error, .. }) => Err(last_error),
                }
            }
            None => self.attempt(&chain, cmd, ctx, deadline).await,
        }
    }

    async fn attempt<C>(
        &self,
        chain: &Arc<RwLock<MiddlewareChain<C>>>,
        cmd: C,
        ctx: Context,
        deadline: Option<Duration>,
    ) -> Result<C::Output, PipelineError>
    where
        C: Command,
    {
        let ticket = self.circuit_breaker.as_ref().map(|cb| cb.before_call());
        let ticket = match ticket {
            Some(Err(rejected)) => return Err(rejected),
            Some(Ok(ticket)) => Some(ticket),
            None => None,
        };

        // Clone the chain out from behind the lock instead of holding a
        // read guard across the dispatch's `.await` points, so a
        // concurrent `add_middleware` is never blocked on an in-flight
        // execution.
        let snapshot = chain.read().clone();
        let run_chain = async move { snapshot.execute(cmd, ctx).await };

        let outcome = match (&self.timeout, deadline) {
            (Some(controller), Some(deadline)) => controller
                .run_with_deadline(deadline, run_chain)
                .await
                .map(|o| o.into_inner()),
            _ => run_chain.await,
        };

        if let Some(cb) = &self.circuit_breaker {
            let ticket = ticket.expect("circuit breaker ticket present when breaker configured");
            match &outcome {
                Ok(_) => cb.record_success(ticket),
                Err(_) => cb.record_failure(ticket),
            }
        }

        outcome
    }
}

trait AnyChainExt {
    fn downcast_arc<C: Command>(&self) -> Arc<RwLock<MiddlewareChain<C>>>;
}

impl AnyChainExt for ChainEntry {
    fn downcast_arc<C: Command>(&self) -> Arc<RwLock<MiddlewareChain<C>>> {
        // `register::<C>` is the only place a chain entry is inserted, and
        // it always stores `RwLock<MiddlewareChain<C>>` under
        // `TypeId::of::<C>()`, so a lookup keyed on that id can only ever
        // find this concrete type.
        Arc::clone(self)
            .downcast::<RwLock<MiddlewareChain<C>>>()
            .expect("chain entry type matches its TypeId key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelinekit_core::backpressure::AdmissionStrategy;
    use pipelinekit_core::circuit_breaker::CircuitBreakerConfig;
    use pipelinekit_core::retry::{DelayStrategy, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    struct Ping;
    impl Command for Ping {
        type Output = &'static str;
    }

    #[tokio::test]
    async fn executes_through_a_registered_handler() {
        let dispatcher = Dispatcher::with_defaults();
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async { Ok("pong") }));

        let result = dispatcher.execute(Ping, Context::new()).await.unwrap();
        assert_eq!(result, "pong");
    }

    #[tokio::test]
    async fn fails_with_no_handler_when_unregistered() {
        let dispatcher = Dispatcher::with_defaults();
        let err = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoHandler));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_the_breaker_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let resilience = ResilienceConfig::builder()
            .retry(RetryConfig::new(3, DelayStrategy::Fixed(Duration::from_millis(1))).unwrap())
            .circuit_breaker(
                CircuitBreakerConfig::new(10, Duration::from_secs(60), 1, 1, Duration::from_secs(3600), None)
                    .unwrap(),
            )
            .build();
        let dispatcher = Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink));
        dispatcher.register::<Ping>(Arc::new(move |_cmd: Ping, _ctx: Context| {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::InvalidState {
                        current: "cold",
                        expected: "warm",
                    })
                } else {
                    Ok("pong")
                }
            }
        }));

        let result = dispatcher.execute(Ping, Context::new()).await.unwrap();
        assert_eq!(result, "pong");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn capacity_stats_reflect_admission_headroom() {
        let resilience = ResilienceConfig::builder()
            .backpressure(5, 5, AdmissionStrategy::Suspend)
            .build();
        let dispatcher = Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink));
        let stats = dispatcher.capacity_stats();
        assert_eq!(stats.max_concurrency, Some(5));
        assert_eq!(stats.max_outstanding, Some(5));
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.utilization, 0.0);
    }

    // End-to-end scenarios composing several resilience features through a
    // single `Dispatcher`, rather than exercising one component in
    // isolation.

    use pipelinekit_core::timeout::TimeoutConfig;
    use pipelinekit_types::{BackPressureReason, Event};
    use std::sync::Mutex;

    struct RecordingEventSink {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingEventSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingEventSink {
        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event.name());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_bound_times_out_under_sustained_saturation() {
        let resilience = ResilienceConfig::builder()
            .backpressure(
                1,
                1,
                AdmissionStrategy::Error {
                    timeout: Some(Duration::from_millis(50)),
                },
            )
            .build();
        let events = RecordingEventSink::new();
        let dispatcher = Arc::new(Dispatcher::new(resilience, events.clone(), Arc::new(NoopMetricsSink)));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("pong")
        }));

        let d = dispatcher.clone();
        let _occupier = tokio::spawn(async move { d.execute(Ping, Context::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BackPressure {
                reason: BackPressureReason::TimedOut
            }
        ));
        assert!(events.names().contains(&"backpressure_rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_grace_recovers_a_slow_but_not_stuck_handler() {
        let resilience = ResilienceConfig::builder()
            .timeout(
                TimeoutConfig::new(Duration::from_millis(20), Some(Duration::from_millis(100)), false)
                    .unwrap(),
            )
            .build();
        let dispatcher = Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok("pong")
        }));

        let result = dispatcher.execute(Ping, Context::new()).await.unwrap();
        assert_eq!(result, "pong");
    }

    // Not `start_paused`: the breaker's cooldown is measured against real
    // wall-clock time (`chrono::Utc::now()`), which a paused tokio clock
    // does not advance.
    #[tokio::test]
    async fn breaker_opens_then_recloses_after_a_successful_half_open_probe() {
        let resilience = ResilienceConfig::builder()
            .circuit_breaker(
                CircuitBreakerConfig::new(2, Duration::from_millis(20), 1, 1, Duration::from_secs(3600), None)
                    .unwrap(),
            )
            .build();
        let dispatcher = Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink));
        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let should_fail_clone = should_fail.clone();
        dispatcher.register::<Ping>(Arc::new(move |_cmd: Ping, _ctx: Context| {
            let should_fail = should_fail_clone.clone();
            async move {
                if should_fail.load(Ordering::SeqCst) {
                    Err(PipelineError::InvalidState {
                        current: "down",
                        expected: "up",
                    })
                } else {
                    Ok("pong")
                }
            }
        }));

        for _ in 0..2 {
            assert!(dispatcher.execute(Ping, Context::new()).await.is_err());
        }
        assert_eq!(dispatcher.breaker_state(), Some(BreakerState::Open));

        let rejected = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(rejected, PipelineError::CircuitRejected { .. }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        should_fail.store(false, Ordering::SeqCst);

        let result = dispatcher.execute(Ping, Context::new()).await.unwrap();
        assert_eq!(result, "pong");
        assert_eq!(dispatcher.breaker_state(), Some(BreakerState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_exponential_backoff_eventually_exhausts() {
        let resilience = ResilienceConfig::builder()
            .retry(
                RetryConfig::new(
                    3,
                    DelayStrategy::Exponential {
                        base: Duration::from_millis(10),
                        multiplier: 2.0,
                        max: Duration::from_secs(1),
                    },
                )
                .unwrap(),
            )
            .build();
        let events = RecordingEventSink::new();
        let dispatcher = Dispatcher::new(resilience, events.clone(), Arc::new(NoopMetricsSink));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            Err::<&'static str, _>(PipelineError::InvalidState {
                current: "down",
                expected: "up",
            })
        }));

        let err = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert_eq!(
            events.names().iter().filter(|n| **n == "retry_attempt").count(),
            3
        );
        assert!(events.names().contains(&"retry_exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn bulkhead_queue_timeout_rejects_when_the_pool_stays_saturated() {
        use pipelinekit_core::bulkhead::{BulkheadConfig, RejectionPolicy};

        let resilience = ResilienceConfig::builder()
            .bulkhead(
                BulkheadConfig::new(1, 10, RejectionPolicy::QueueWithTimeout(Duration::from_millis(30)))
                    .unwrap(),
            )
            .build();
        let dispatcher = Arc::new(Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink)));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("pong")
        }));

        let d = dispatcher.clone();
        let _occupier = tokio::spawn(async move { d.execute(Ping, Context::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::BulkheadRejected));
    }

    #[tokio::test]
    async fn bulkhead_fallback_substitutes_a_value_when_saturated() {
        use pipelinekit_core::bulkhead::{fallback_value, BulkheadConfig};

        let resilience = ResilienceConfig::builder()
            .bulkhead(BulkheadConfig::new(1, 10, fallback_value::<&'static str>("fallback")).unwrap())
            .build();
        let dispatcher = Arc::new(Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink)));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("pong")
        }));

        let d = dispatcher.clone();
        let _occupier = tokio::spawn(async move { d.execute(Ping, Context::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = dispatcher.execute(Ping, Context::new()).await.unwrap();
        assert_eq!(result, "fallback");
    }

    #[tokio::test]
    async fn bulkhead_fallback_type_mismatch_surfaces_as_type_mismatch_error() {
        use pipelinekit_core::bulkhead::BulkheadConfig;
        use pipelinekit_core::RejectionPolicy;
        use std::any::Any;

        let resilience = ResilienceConfig::builder()
            .bulkhead(
                BulkheadConfig::new(
                    1,
                    10,
                    RejectionPolicy::Fallback(Arc::new(|| Box::new(42u32) as Box<dyn Any + Send>)),
                )
                .unwrap(),
            )
            .build();
        let dispatcher = Arc::new(Dispatcher::new(resilience, Arc::new(NoopEventSink), Arc::new(NoopMetricsSink)));
        dispatcher.register::<Ping>(Arc::new(|_cmd: Ping, _ctx: Context| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("pong")
        }));

        let d = dispatcher.clone();
        let _occupier = tokio::spawn(async move { d.execute(Ping, Context::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = dispatcher.execute(Ping, Context::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }
}
