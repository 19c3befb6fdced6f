use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Phase a timeout failed in, distinguishing an initial deadline miss from
/// one that happened during the grace window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// The operation did not complete before the primary deadline and no
    /// grace period was configured.
    Initial,
    /// The operation did not complete before the grace period elapsed.
    GraceExpired,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::GraceExpired => write!(f, "grace_expired"),
        }
    }
}

/// Why a backpressure-admission decision rejected or dropped a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackPressureReason {
    /// Outstanding bound reached under the `Error` strategy with no timeout.
    QueueFull,
    /// A timeout elapsed while waiting for a permit under the `Error`
    /// strategy with a configured deadline.
    TimedOut,
    /// The request itself was dropped under `DropNewest` or lost a
    /// priority comparison under `DropPriority`.
    DroppedNewest,
    /// A different, already-queued waiter was dropped to make room under
    /// `DropOldest` or `DropPriority`.
    DroppedOldest,
    /// A lower-priority queued waiter was dropped under `DropPriority`.
    DroppedLowPriority,
}

impl fmt::Display for BackPressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::TimedOut => write!(f, "timed out waiting for admission"),
            Self::DroppedNewest => write!(f, "dropped newest request"),
            Self::DroppedOldest => write!(f, "dropped oldest queued request"),
            Self::DroppedLowPriority => write!(f, "dropped lowest-priority queued request"),
        }
    }
}

/// The full error surface produced by the resilience core.
///
/// Every variant carries the structured fields needed to report the
/// failure without string inspection (reason, deadline, state), per
/// spec.md §7.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `execute` was called for a command type with no registered handler
    /// or pipeline.
    #[error("no handler registered for this command type")]
    NoHandler,

    /// A fallback or custom policy produced a value that did not match the
    /// command's declared `Output` type.
    #[error("result type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    /// An operation was attempted from a state that does not permit it
    /// (e.g. releasing a permit twice).
    #[error("invalid state: in {current}, expected {expected}")]
    InvalidState {
        current: &'static str,
        expected: &'static str,
    },

    /// The wrapped operation did not complete before its deadline.
    #[error("timed out ({phase})")]
    Timeout { phase: TimeoutPhase },

    /// An admission-control decision rejected or dropped the request.
    #[error("backpressure: {reason}")]
    BackPressure { reason: BackPressureReason },

    /// The circuit breaker denied the request while open.
    #[error("circuit open until {until}")]
    CircuitRejected { until: DateTime<Utc> },

    /// The bulkhead's concurrency and queue bounds were both exhausted, or
    /// the queue wait itself timed out.
    #[error("bulkhead rejected the request")]
    BulkheadRejected,

    /// The caller's task was cancelled while waiting for a permit or for
    /// an operation to complete.
    #[error("cancelled")]
    Cancelled,

    /// The wrapped handler or operation itself failed; the inner error is
    /// propagated as-is.
    #[error("operation failed: {0}")]
    WrappedOperationError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PipelineError {
    /// Convenience constructor for [`Self::WrappedOperationError`].
    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::WrappedOperationError(Box::new(err))
    }
}

/// Errors raised while validating component configuration at construction.
///
/// Construction-time validation failures are returned immediately rather
/// than deferred, per spec.md §7.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be > 0, got {value}")]
    MustBePositive { field: &'static str, value: i64 },

    #[error("{field} must be > 0, got {value:?}")]
    DurationMustBePositive {
        field: &'static str,
        value: std::time::Duration,
    },

    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}
