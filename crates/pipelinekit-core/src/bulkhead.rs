use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use pipelinekit_types::{ConfigError, Event, EventSink, PipelineError};
use thiserror::Error;

use crate::semaphore::{AsyncSemaphore, Permit, SemaphoreError};

/// A policy's fallback/custom arm hands back a type-erased value rather
/// than a concrete `T`: the bulkhead itself has no `Command` in scope, so
/// it can't know the caller's output type. The caller downcasts via
/// `Box<downcast>` once it does.
pub type FallbackValue = Box<dyn Any + Send>;

/// What happens to a request that arrives once `max_concurrency` is
/// already in use.
#[derive(Clone)]
pub enum RejectionPolicy {
    /// Fail the request right away; never queue it.
    RejectImmediately,
    /// Queue the request, failing it if a slot hasn't freed up within
    /// `timeout`, or if the queue is already at `max_queue`.
    QueueWithTimeout(Duration),
    /// Never queue; instead hand back a substitute value produced fresh
    /// for each rejection.
    Fallback(Arc<dyn Fn() -> FallbackValue + Send + Sync>),
    /// Never queue; the substitute value can depend on why admission was
    /// denied.
    Custom(Arc<dyn Fn(&BulkheadError) -> FallbackValue + Send + Sync>),
}

/// Convenience constructor for [`RejectionPolicy::Fallback`] when the
/// substitute is just a fixed, cloneable value.
pub fn fallback_value<T: Clone + Send + 'static>(value: T) -> RejectionPolicy {
    RejectionPolicy::Fallback(Arc::new(move || Box::new(value.clone()) as FallbackValue))
}

#[derive(Clone)]
pub struct BulkheadConfig {
    pub max_concurrency: usize,
    /// Upper bound on queued waiters, enforced only by `QueueWithTimeout`
    /// (the other policies never queue in the first place). Distinct from
    /// `queue_timeout`: this caps how many requests may wait at once, while
    /// the timeout caps how long any one of them waits.
    pub max_queue: usize,
    pub rejection: RejectionPolicy,
}

impl BulkheadConfig {
    pub fn new(
        max_concurrency: usize,
        max_queue: usize,
        rejection: RejectionPolicy,
    ) -> Result<Self, ConfigError> {
        if max_concurrency == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_concurrency",
                value: max_concurrency as i64,
            });
        }
        Ok(Self {
            max_concurrency,
            max_queue,
            rejection,
        })
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadError {
    #[error("bulkhead rejected the request")]
    Rejected,
    #[error("bulkhead queue is full")]
    QueueFull,
}

impl From<BulkheadError> for PipelineError {
    fn from(_: BulkheadError) -> Self {
        PipelineError::BulkheadRejected
    }
}

/// What admission produced: either a genuine permit to run the operation,
/// or a substitute value handed back in its place by `Fallback`/`Custom`.
pub enum Admission {
    Granted(Permit),
    Substituted(FallbackValue),
}

/// Isolates a pool of concurrent work from the rest of the system: a slow
/// or failing downstream can saturate its own bulkhead without starving
/// every other caller of the shared dispatcher. See spec §4.6.
pub struct Bulkhead {
    semaphore: AsyncSemaphore,
    config: BulkheadConfig,
    events: Arc<dyn EventSink>,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            semaphore: AsyncSemaphore::new(config.max_concurrency),
            config,
            events,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    pub fn available(&self) -> usize {
        self.semaphore.available()
    }

    pub fn queue_depth(&self) -> usize {
        self.semaphore.queue_depth()
    }

    pub async fn admit(&self) -> Result<Admission, BulkheadError> {
        match &self.config.rejection {
            RejectionPolicy::RejectImmediately => match self.semaphore.try_acquire() {
                Some(permit) => {
                    self.events.record(Event::BulkheadAdmitted);
                    Ok(Admission::Granted(permit))
                }
                None => {
                    self.events.record(Event::BulkheadRejected);
                    Err(BulkheadError::Rejected)
                }
            },
            RejectionPolicy::QueueWithTimeout(timeout) => {
                if let Some(permit) = self.semaphore.try_acquire() {
                    self.events.record(Event::BulkheadAdmitted);
                    return Ok(Admission::Granted(permit));
                }
                if self.semaphore.queue_depth() >= self.config.max_queue {
                    self.events.record(Event::BulkheadRejected);
                    return Err(BulkheadError::QueueFull);
                }
                self.events.record(Event::BulkheadQueued);
                match self.semaphore.acquire_timeout(*timeout).await {
                    Ok(permit) => {
                        self.events.record(Event::BulkheadAdmitted);
                        Ok(Admission::Granted(permit))
                    }
                    Err(SemaphoreError::TimedOut | SemaphoreError::Cancelled) => {
                        self.events.record(Event::BulkheadRejected);
                        Err(BulkheadError::Rejected)
                    }
                }
            }
            RejectionPolicy::Fallback(make_value) => match self.semaphore.try_acquire() {
                Some(permit) => {
                    self.events.record(Event::BulkheadAdmitted);
                    Ok(Admission::Granted(permit))
                }
                None => {
                    self.events.record(Event::BulkheadRejected);
                    Ok(Admission::Substituted(make_value()))
                }
            },
            RejectionPolicy::Custom(make_value) => match self.semaphore.try_acquire() {
                Some(permit) => {
                    self.events.record(Event::BulkheadAdmitted);
                    Ok(Admission::Granted(permit))
                }
                None => {
                    self.events.record(Event::BulkheadRejected);
                    Ok(Admission::Substituted(make_value(&BulkheadError::Rejected)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelinekit_types::NoopEventSink;
    use std::sync::Arc;

    fn bulkhead(max: usize, max_queue: usize, rejection: RejectionPolicy) -> Bulkhead {
        Bulkhead::new(
            BulkheadConfig::new(max, max_queue, rejection).unwrap(),
            Arc::new(NoopEventSink),
        )
    }

    fn assert_granted(admission: Admission) -> Permit {
        match admission {
            Admission::Granted(permit) => permit,
            Admission::Substituted(_) => panic!("expected a genuine permit"),
        }
    }

    #[tokio::test]
    async fn reject_immediately_fails_fast_when_saturated() {
        let bh = bulkhead(1, 10, RejectionPolicy::RejectImmediately);
        let _held = assert_granted(bh.admit().await.unwrap());
        assert_eq!(bh.admit().await.unwrap_err(), BulkheadError::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_with_timeout_admits_once_a_slot_frees() {
        let bh = Arc::new(bulkhead(
            1,
            10,
            RejectionPolicy::QueueWithTimeout(Duration::from_millis(200)),
        ));
        let held = assert_granted(bh.admit().await.unwrap());
        let bh2 = bh.clone();
        let waiter = tokio::spawn(async move { bh2.admit().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_with_timeout_rejects_if_nothing_frees_in_time() {
        let bh = bulkhead(
            1,
            10,
            RejectionPolicy::QueueWithTimeout(Duration::from_millis(20)),
        );
        let _held = assert_granted(bh.admit().await.unwrap());
        assert_eq!(bh.admit().await.unwrap_err(), BulkheadError::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_with_timeout_fails_fast_once_max_queue_is_reached() {
        let bh = Arc::new(bulkhead(
            1,
            1,
            RejectionPolicy::QueueWithTimeout(Duration::from_millis(500)),
        ));
        let _held = assert_granted(bh.admit().await.unwrap());

        let bh2 = bh.clone();
        let first_waiter = tokio::spawn(async move { bh2.admit().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bh.queue_depth(), 1);

        // The queue is already at max_queue (1), so this one fails fast
        // without ever waiting out its timeout.
        assert_eq!(bh.admit().await.unwrap_err(), BulkheadError::QueueFull);
        first_waiter.abort();
    }

    #[tokio::test]
    async fn fallback_hands_back_a_substitute_value_when_saturated() {
        let bh = bulkhead(1, 10, fallback_value::<u32>(7));
        let _held = assert_granted(bh.admit().await.unwrap());
        match bh.admit().await.unwrap() {
            Admission::Substituted(value) => {
                assert_eq!(*value.downcast::<u32>().unwrap(), 7);
            }
            Admission::Granted(_) => panic!("expected a substituted value"),
        }
    }

    #[tokio::test]
    async fn custom_policy_receives_the_rejection_reason() {
        let bh = bulkhead(
            1,
            10,
            RejectionPolicy::Custom(Arc::new(|err| {
                Box::new(format!("{err}")) as FallbackValue
            })),
        );
        let _held = assert_granted(bh.admit().await.unwrap());
        match bh.admit().await.unwrap() {
            Admission::Substituted(value) => {
                let msg = value.downcast::<String>().unwrap();
                assert_eq!(*msg, "bulkhead rejected the request");
            }
            Admission::Granted(_) => panic!("expected a substituted value"),
        }
    }
}
