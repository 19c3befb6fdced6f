use crate::backpressure::AdmissionStrategy;
use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;

/// Resilience features are opt-in: a pipeline that only needs backpressure
/// leaves the rest `None` rather than carrying defaults nobody asked for.
#[derive(Clone, Default)]
pub struct ResilienceConfig {
    /// `(concurrency, outstanding_bound, strategy)` per spec §4.2.
    pub backpressure: Option<(usize, usize, AdmissionStrategy)>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub retry: Option<RetryConfig>,
    pub bulkhead: Option<BulkheadConfig>,
}

impl ResilienceConfig {
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::default()
    }
}

/// Construction-time validation already happened in each component's own
/// `new`/`new` constructor; this builder just collects the already-valid
/// pieces so a pipeline can opt into whichever subset it needs.
#[derive(Default)]
pub struct ResilienceConfigBuilder {
    backpressure: Option<(usize, usize, AdmissionStrategy)>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    timeout: Option<TimeoutConfig>,
    retry: Option<RetryConfig>,
    bulkhead: Option<BulkheadConfig>,
}

impl ResilienceConfigBuilder {
    pub fn backpressure(
        mut self,
        concurrency: usize,
        outstanding_bound: usize,
        strategy: AdmissionStrategy,
    ) -> Self {
        self.backpressure = Some((concurrency, outstanding_bound, strategy));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn build(self) -> ResilienceConfig {
        ResilienceConfig {
            backpressure: self.backpressure,
            circuit_breaker: self.circuit_breaker,
            timeout: self.timeout,
            retry: self.retry,
            bulkhead: self.bulkhead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builder_collects_only_the_configured_features() {
        let config = ResilienceConfig::builder()
            .backpressure(10, 10, AdmissionStrategy::Suspend)
            .timeout(TimeoutConfig::new(Duration::from_secs(1), None, false).unwrap())
            .build();
        assert!(config.backpressure.is_some());
        assert!(config.timeout.is_some());
        assert!(config.circuit_breaker.is_none());
        assert!(config.retry.is_none());
        assert!(config.bulkhead.is_none());
    }
}
