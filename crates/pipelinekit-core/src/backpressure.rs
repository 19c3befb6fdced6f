use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipelinekit_types::{BackPressureReason, Event, EventSink, PipelineError};
use tracing::debug;

use crate::semaphore::{AsyncSemaphore, Permit as InnerPermit, SemaphoreError};

/// How admission behaves once the outstanding bound `O` is reached.
///
/// See spec §4.2 for the full decision table; `DropOldest`/`DropNewest`/
/// `DropPriority` only make sense when callers are actually queued (i.e.
/// under `Suspend`-like waiting), so they're modelled here as strategies in
/// their own right rather than modifiers on `Suspend`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AdmissionStrategy {
    /// Block the caller until a slot frees up, with no bound on wait time.
    Suspend,
    /// Fail immediately with `QueueFull` if no slot is free; if `timeout` is
    /// set, wait up to that long before failing with `TimedOut` instead.
    Error { timeout: Option<Duration> },
    /// Always admit the newest request by cancelling the longest-waiting
    /// queued one, if any are queued; otherwise behaves like `Suspend`.
    DropOldest,
    /// Never queue the new request: if no slot is free, reject it
    /// immediately in favor of whoever is already waiting.
    DropNewest,
    /// Evict the lowest-priority queued request if the newcomer outranks
    /// it; otherwise drop the newcomer itself. Priority is whatever the
    /// caller passes to `admit_with_priority` (higher wins ties go to the
    /// earlier arrival).
    DropPriority(i32),
}

/// A single consistent snapshot of a regulator's live occupancy and
/// lifetime counters. All fields are read under one lock acquisition, so a
/// caller never observes e.g. `active` and `queued` from two different
/// instants.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BackpressureStats {
    pub active: usize,
    pub queued: usize,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub max_queue_depth_observed: usize,
}

#[derive(Default)]
struct Counters {
    active: usize,
    queued: usize,
    total_processed: u64,
    total_rejected: u64,
    max_queue_depth_observed: usize,
}

/// Bounds a command pipeline along two independent axes, per spec §4.2:
/// `concurrency` (`C`) limits how many commands may execute at once,
/// `outstanding_bound` (`O`, with `O >= C`) limits how many may be admitted
/// at all (executing plus queued waiting to execute).
///
/// Modelled as two `AsyncSemaphore`s stacked in series: a permit from the
/// outstanding semaphore is held for a command's entire admitted lifetime
/// and is where the admission strategy applies; a permit from the
/// concurrency semaphore is acquired only once it's actually this
/// command's turn to run, and is always a plain FIFO wait (by construction
/// `C <= O`, so it always eventually comes through). `queued` counts time
/// spent waiting on the inner concurrency semaphore.
pub struct BackpressureRegulator {
    outstanding: AsyncSemaphore,
    concurrency: AsyncSemaphore,
    strategy: AdmissionStrategy,
    events: Arc<dyn EventSink>,
    counters: Arc<Mutex<Counters>>,
}

impl BackpressureRegulator {
    pub fn new(
        concurrency: usize,
        outstanding_bound: usize,
        strategy: AdmissionStrategy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            outstanding: AsyncSemaphore::new(outstanding_bound),
            concurrency: AsyncSemaphore::new(concurrency),
            strategy,
            events,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    pub fn concurrency_bound(&self) -> usize {
        self.concurrency.capacity()
    }

    pub fn outstanding_bound(&self) -> usize {
        self.outstanding.capacity()
    }

    /// Concurrency permits free right now. Diagnostic only, per the same
    /// caveat as [`AsyncSemaphore::available`].
    pub fn available(&self) -> usize {
        self.concurrency.available()
    }

    /// Live occupancy and lifetime counters, read as a single snapshot.
    pub fn stats(&self) -> BackpressureStats {
        let c = self.counters.lock();
        BackpressureStats {
            active: c.active,
            queued: c.queued,
            total_processed: c.total_processed,
            total_rejected: c.total_rejected,
            max_queue_depth_observed: c.max_queue_depth_observed,
        }
    }

    pub async fn admit(&self) -> Result<Permit, PipelineError> {
        self.admit_with_priority(0).await
    }

    /// Admit a request, consulting `priority` only under `DropPriority`
    /// (ignored by every other strategy).
    pub async fn admit_with_priority(&self, priority: i32) -> Result<Permit, PipelineError> {
        let outstanding = self.reserve_outstanding(priority).await?;

        {
            let mut c = self.counters.lock();
            c.queued += 1;
            c.max_queue_depth_observed = c.max_queue_depth_observed.max(c.queued);
        }
        self.events.record(Event::BackpressureQueued);
        let concurrency = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        {
            let mut c = self.counters.lock();
            c.queued -= 1;
            c.active += 1;
        }
        self.events.record(Event::BackpressureAdmitted);

        Ok(Permit {
            counters: self.counters.clone(),
            _outstanding: outstanding,
            _concurrency: concurrency,
        })
    }

    /// Acquire a slot within the outstanding bound `O`, applying the
    /// configured strategy once that bound is saturated.
    async fn reserve_outstanding(&self, priority: i32) -> Result<InnerPermit, PipelineError> {
        match self.strategy {
            AdmissionStrategy::Suspend => self
                .outstanding
                .acquire()
                .await
                .map_err(|_| PipelineError::Cancelled),

            AdmissionStrategy::Error { timeout: None } => {
                self.outstanding.try_acquire().ok_or_else(|| {
                    self.reject();
                    PipelineError::BackPressure {
                        reason: BackPressureReason::QueueFull,
                    }
                })
            }

            AdmissionStrategy::Error {
                timeout: Some(deadline),
            } => match self.outstanding.acquire_timeout(deadline).await {
                Ok(p) => Ok(p),
                Err(SemaphoreError::TimedOut) => {
                    self.reject();
                    Err(PipelineError::BackPressure {
                        reason: BackPressureReason::TimedOut,
                    })
                }
                Err(SemaphoreError::Cancelled) => Err(PipelineError::Cancelled),
            },

            AdmissionStrategy::DropOldest => {
                if let Some(p) = self.outstanding.try_acquire() {
                    return Ok(p);
                }
                if self.outstanding.cancel_oldest_waiter() {
                    debug!("backpressure: evicting oldest queued waiter to admit a newer one");
                }
                match self.outstanding.acquire().await {
                    Ok(p) => Ok(p),
                    Err(SemaphoreError::Cancelled) => {
                        self.reject();
                        Err(PipelineError::BackPressure {
                            reason: BackPressureReason::DroppedOldest,
                        })
                    }
                    Err(SemaphoreError::TimedOut) => {
                        self.reject();
                        Err(PipelineError::BackPressure {
                            reason: BackPressureReason::TimedOut,
                        })
                    }
                }
            }

            AdmissionStrategy::DropNewest => self.outstanding.try_acquire().ok_or_else(|| {
                debug!("backpressure: dropping newest request, outstanding bound saturated");
                self.reject();
                PipelineError::BackPressure {
                    reason: BackPressureReason::DroppedNewest,
                }
            }),

            AdmissionStrategy::DropPriority(_) => {
                if let Some(p) = self.outstanding.try_acquire() {
                    return Ok(p);
                }
                if self
                    .outstanding
                    .cancel_lowest_priority_waiter_below(priority)
                {
                    debug!(
                        "backpressure: evicting a lower-priority queued waiter to admit this one"
                    );
                    match self.outstanding.acquire_with_priority(priority).await {
                        Ok(p) => Ok(p),
                        Err(SemaphoreError::Cancelled) => {
                            self.reject();
                            Err(PipelineError::BackPressure {
                                reason: BackPressureReason::DroppedLowPriority,
                            })
                        }
                        Err(SemaphoreError::TimedOut) => {
                            self.reject();
                            Err(PipelineError::BackPressure {
                                reason: BackPressureReason::TimedOut,
                            })
                        }
                    }
                } else {
                    debug!("backpressure: newcomer did not outrank any queued waiter, dropping it");
                    self.reject();
                    Err(PipelineError::BackPressure {
                        reason: BackPressureReason::DroppedNewest,
                    })
                }
            }
        }
    }

    fn reject(&self) {
        self.counters.lock().total_rejected += 1;
        self.events.record(Event::BackpressureRejected);
    }
}

/// A held admission slot, spanning both the outstanding reservation and the
/// concurrency slot it guards. Dropping it (or calling `release`) frees
/// both in one step and folds the command into `total_processed`.
pub struct Permit {
    counters: Arc<Mutex<Counters>>,
    _outstanding: InnerPermit,
    _concurrency: InnerPermit,
}

impl Permit {
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut c = self.counters.lock();
        c.active = c.active.saturating_sub(1);
        c.total_processed += 1;
    }
}
