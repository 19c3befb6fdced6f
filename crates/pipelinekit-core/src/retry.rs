use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pipelinekit_types::{ConfigError, Event, EventSink};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// How the delay between retry attempts grows. `attempt` passed to each
/// variant is 1-based and counts the attempt that just failed.
#[derive(Clone)]
pub enum DelayStrategy {
    Fixed(Duration),
    Linear {
        base: Duration,
        increment: Duration,
    },
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
    /// Exponential backoff with full jitter: the actual delay is drawn
    /// uniformly from `[0, exponential_delay]`, which spreads out retries
    /// from callers that all failed at the same moment.
    ExponentialJitter {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl DelayStrategy {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Linear { base, increment } => *base + *increment * (attempt.saturating_sub(1)),
            Self::Exponential {
                base,
                multiplier,
                max,
            } => exponential_delay(*base, *multiplier, *max, attempt),
            Self::ExponentialJitter {
                base,
                multiplier,
                max,
            } => {
                let cap = exponential_delay(*base, *multiplier, *max, attempt);
                if cap.is_zero() {
                    cap
                } else {
                    let nanos = cap.as_nanos().min(u128::from(u64::MAX)) as u64;
                    Duration::from_nanos(rand::rng().random_range(0..=nanos))
                }
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

fn exponential_delay(base: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let scaled = base.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64(scaled.max(0.0)).min(max)
}

type ShouldRetry = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first, not additional retries.
    pub max_attempts: u32,
    pub delay: DelayStrategy,
    /// Gates whether a given failure is retried at all. Defaults to
    /// always-retry; a caller that only wants to retry, say, transient
    /// network errors installs a narrower predicate via
    /// [`Self::with_predicate`].
    should_retry: ShouldRetry,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay: DelayStrategy) -> Result<Self, ConfigError> {
        Self::with_predicate(max_attempts, delay, Arc::new(|_| true))
    }

    pub fn with_predicate(
        max_attempts: u32,
        delay: DelayStrategy,
        should_retry: ShouldRetry,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_attempts",
                value: max_attempts as i64,
            });
        }
        Ok(Self {
            max_attempts,
            delay,
            should_retry,
        })
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("exhausted {attempts} attempt(s), last error: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

/// Retries a fallible async operation up to `max_attempts` times, per spec
/// §4.5. Takes the attempt closure rather than a bare future since each
/// attempt needs its own invocation (a `Future` can only run once).
pub struct RetryController {
    config: RetryConfig,
    events: Arc<dyn EventSink>,
}

impl RetryController {
    pub fn new(config: RetryConfig, events: Arc<dyn EventSink>) -> Self {
        Self { config, events }
    }

    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 1;
        loop {
            self.events.record(Event::RetryAttempt { attempt });
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(last_error) => {
                    let exhausted = attempt >= self.config.max_attempts;
                    let retryable = (self.config.should_retry)(&last_error);
                    if exhausted || !retryable {
                        self.events
                            .record(Event::RetryExhausted { attempts: attempt });
                        warn!(attempt, retryable, "retry budget exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error,
                        });
                    }
                    let delay = self.config.delay.delay_for(attempt);
                    self.events.record(Event::RetryDelay { attempt, delay });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelinekit_types::NoopEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    #[error("{0}")]
    struct Failure(&'static str);

    fn controller(max_attempts: u32, delay: DelayStrategy) -> RetryController {
        RetryController::new(
            RetryConfig::new(max_attempts, delay).unwrap(),
            Arc::new(NoopEventSink),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let ctl = controller(3, DelayStrategy::Fixed(Duration::from_millis(1)));
        let calls = AtomicU32::new(0);
        let result = ctl
            .run(|_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Failure("not yet"))
                    } else {
                        Ok::<_, Failure>(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let ctl = controller(2, DelayStrategy::Fixed(Duration::from_millis(1)));
        let result = ctl
            .run(|_attempt| async { Err::<(), Failure>(Failure("boom")) })
            .await;
        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, Failure("boom"));
            }
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_predicate_gates_retries() {
        let config = RetryConfig::with_predicate(
            5,
            DelayStrategy::Fixed(Duration::from_millis(1)),
            Arc::new(|err| err.to_string() != "fatal"),
        )
        .unwrap();
        let ctl = RetryController::new(config, Arc::new(NoopEventSink));
        let calls = AtomicU32::new(0);
        let result = ctl
            .run(|_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), Failure>(Failure("fatal")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn exponential_delay_caps_at_max() {
        let d = exponential_delay(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
            10,
        );
        assert_eq!(d, Duration::from_millis(500));
    }

    #[test]
    fn exponential_delay_grows_with_attempt() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        let d1 = exponential_delay(base, 2.0, max, 1);
        let d2 = exponential_delay(base, 2.0, max, 2);
        let d3 = exponential_delay(base, 2.0, max, 3);
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(400));
    }

    #[test]
    fn jittered_delay_never_exceeds_the_unjittered_cap() {
        let strategy = DelayStrategy::ExponentialJitter {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        };
        for attempt in 1..=5 {
            let cap = exponential_delay(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(10),
                attempt,
            );
            let actual = strategy.delay_for(attempt);
            assert!(actual <= cap);
        }
    }
}
