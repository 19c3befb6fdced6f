use std::time::Duration;

use crate::error::TimeoutPhase;

/// Structured observability events emitted by the resilience core.
///
/// Each variant corresponds to one of the named events in spec.md §4.
/// Consumers (loggers, metrics exporters, test probes) implement
/// [`EventSink`] and receive these as they happen; the core itself never
/// inspects event content, only emits it.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// C4: the primary deadline started ticking.
    TimeoutStarted,
    /// C4: the primary deadline elapsed without the operation completing.
    TimeoutExceeded,
    /// C4: entered the grace window after the primary deadline elapsed.
    GracePeriodStarted,
    /// C4: the operation completed during the grace window.
    GraceRecovered,
    /// C4: the grace window also elapsed without completion.
    GraceExpired,
    /// C4: the operation completed between 0.9x and 1x of the deadline.
    NearTimeout,

    /// C5: attempt `k` of a retried operation started.
    RetryAttempt { attempt: u32 },
    /// C5: the delay computed before retry attempt `k`.
    RetryDelay { attempt: u32, delay: Duration },
    /// C5: the retry budget was exhausted without success.
    RetryExhausted { attempts: u32 },

    /// C3: the breaker transitioned to a new state.
    BreakerStateChanged {
        from: &'static str,
        to: &'static str,
    },
    /// C3: a request was denied while the breaker is open.
    BreakerRejected,

    /// C2: admission accepted, queued, or rejected a request.
    BackpressureAdmitted,
    BackpressureQueued,
    BackpressureRejected,

    /// C6: a request was queued, admitted, or rejected by the bulkhead.
    BulkheadQueued,
    BulkheadAdmitted,
    BulkheadRejected,
}

impl Event {
    /// Stable event name, for logging and metrics label values.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TimeoutStarted => "timeout_started",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::GracePeriodStarted => "grace_period_started",
            Self::GraceRecovered => "grace_recovered",
            Self::GraceExpired => "grace_expired",
            Self::NearTimeout => "near_timeout",
            Self::RetryAttempt { .. } => "retry_attempt",
            Self::RetryDelay { .. } => "retry_delay",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::BreakerStateChanged { .. } => "breaker_state_changed",
            Self::BreakerRejected => "breaker_rejected",
            Self::BackpressureAdmitted => "backpressure_admitted",
            Self::BackpressureQueued => "backpressure_queued",
            Self::BackpressureRejected => "backpressure_rejected",
            Self::BulkheadQueued => "bulkhead_queued",
            Self::BulkheadAdmitted => "bulkhead_admitted",
            Self::BulkheadRejected => "bulkhead_rejected",
        }
    }
}

impl From<TimeoutPhase> for Event {
    fn from(phase: TimeoutPhase) -> Self {
        match phase {
            TimeoutPhase::Initial => Event::TimeoutExceeded,
            TimeoutPhase::GraceExpired => Event::GraceExpired,
        }
    }
}

/// Observer registry: receives every [`Event`] emitted during a dispatch.
///
/// An external collaborator per spec.md §1 — the core only ever calls
/// `record`, never owns sink setup (log formatting, export transport).
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Default sink that discards every event; used when a caller doesn't wire
/// up observability.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: Event) {}
}
