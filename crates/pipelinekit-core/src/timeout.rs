use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipelinekit_types::{Command, ConfigError, Event, EventSink, PipelineError, TimeoutPhase};
use tokio::time::Instant;

/// Fraction of the primary deadline past which a completion is reported as
/// a near-timeout even though it succeeded.
const NEAR_TIMEOUT_THRESHOLD: f64 = 0.9;

#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    pub deadline: Duration,
    /// Extra time granted after the primary deadline elapses before the
    /// operation is actually abandoned. `None` means fail immediately.
    pub grace: Option<Duration>,
    /// If true, the operation is aborted once it's given up on for good
    /// (no grace configured, or grace also expired). If false, it's left
    /// running in the background and its eventual result is discarded.
    pub cancel_on_timeout: bool,
}

impl TimeoutConfig {
    pub fn new(
        deadline: Duration,
        grace: Option<Duration>,
        cancel_on_timeout: bool,
    ) -> Result<Self, ConfigError> {
        if deadline.is_zero() {
            return Err(ConfigError::DurationMustBePositive {
                field: "deadline",
                value: deadline,
            });
        }
        if let Some(grace) = grace {
            if grace.is_zero() {
                return Err(ConfigError::DurationMustBePositive {
                    field: "grace",
                    value: grace,
                });
            }
        }
        Ok(Self {
            deadline,
            grace,
            cancel_on_timeout,
        })
    }
}

/// Resolves the effective deadline for a command, per spec §4.4's
/// resolution chain: a per-command override beats a per-command-type
/// entry, which beats a custom resolver callback, which beats the
/// controller's own default.
#[derive(Default)]
pub struct TimeoutResolver {
    per_type: HashMap<TypeId, Duration>,
    custom: Option<Arc<dyn Fn(TypeId) -> Option<Duration> + Send + Sync>>,
}

impl TimeoutResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type<C: Command>(mut self, deadline: Duration) -> Self {
        self.per_type.insert(TypeId::of::<C>(), deadline);
        self
    }

    pub fn with_custom_resolver(
        mut self,
        resolver: Arc<dyn Fn(TypeId) -> Option<Duration> + Send + Sync>,
    ) -> Self {
        self.custom = Some(resolver);
        self
    }

    fn resolve<C: Command>(&self, cmd: &C, default: Duration) -> Duration {
        cmd.timeout_override()
            .or_else(|| self.per_type.get(&TypeId::of::<C>()).copied())
            .or_else(|| self.custom.as_ref().and_then(|f| f(TypeId::of::<C>())))
            .unwrap_or(default)
    }
}

/// How a completed operation relates to its deadline, for callers that want
/// to react to a close call even when it technically succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome<T> {
    OnTime(T),
    /// Completed past `NEAR_TIMEOUT_THRESHOLD` of the deadline but before
    /// it elapsed.
    NearTimeout(T),
    /// The primary deadline elapsed but the operation finished within the
    /// grace window.
    GraceRecovered(T),
}

impl<T> TimeoutOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::OnTime(v) | Self::NearTimeout(v) | Self::GraceRecovered(v) => v,
        }
    }
}

/// Enforces a deadline on an async operation, with an optional grace window
/// before the operation is actually abandoned. See spec §4.4.
pub struct TimeoutController {
    config: TimeoutConfig,
    resolver: TimeoutResolver,
    events: Arc<dyn EventSink>,
}

impl TimeoutController {
    pub fn new(config: TimeoutConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            resolver: TimeoutResolver::default(),
            events,
        }
    }

    pub fn with_resolver(
        config: TimeoutConfig,
        resolver: TimeoutResolver,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            resolver,
            events,
        }
    }

    /// Resolve the deadline that would apply to `cmd`, without running
    /// anything. Exposed so a caller can compute this before moving `cmd`
    /// into the operation future.
    pub fn resolve_deadline<C: Command>(&self, cmd: &C) -> Duration {
        self.resolver.resolve(cmd, self.config.deadline)
    }

    pub async fn run_for<C, F, T, E>(
        &self,
        cmd: &C,
        op: F,
    ) -> Result<TimeoutOutcome<T>, PipelineError>
    where
        C: Command,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let deadline = self.resolve_deadline(cmd);
        self.run_with_deadline(deadline, op).await
    }

    /// Run `op` against the controller's own default deadline, bypassing
    /// the per-command resolution chain. Useful for direct consumers with
    /// no `Command` in scope.
    pub async fn run<F, T, E>(&self, op: F) -> Result<TimeoutOutcome<T>, PipelineError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_with_deadline(self.config.deadline, op).await
    }

    pub async fn run_with_deadline<F, T, E>(
        &self,
        deadline: Duration,
        op: F,
    ) -> Result<TimeoutOutcome<T>, PipelineError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.events.record(Event::TimeoutStarted);
        let start = Instant::now();
        let mut handle = tokio::spawn(op);

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(self.classify_on_time(start, deadline, value)),
            Ok(Ok(Err(err))) => Err(PipelineError::wrap(err)),
            Ok(Err(join_err)) => Err(PipelineError::wrap(join_err)),
            Err(_elapsed) => {
                self.events.record(Event::TimeoutExceeded);
                match self.config.grace {
                    None => {
                        if self.config.cancel_on_timeout {
                            handle.abort();
                        }
                        Err(PipelineError::Timeout {
                            phase: TimeoutPhase::Initial,
                        })
                    }
                    Some(grace) => {
                        self.events.record(Event::GracePeriodStarted);
                        match tokio::time::timeout(grace, &mut handle).await {
                            Ok(Ok(Ok(value))) => {
                                self.events.record(Event::GraceRecovered);
                                Ok(TimeoutOutcome::GraceRecovered(value))
                            }
                            Ok(Ok(Err(err))) => Err(PipelineError::wrap(err)),
                            Ok(Err(join_err)) => Err(PipelineError::wrap(join_err)),
                            Err(_elapsed) => {
                                self.events.record(Event::GraceExpired);
                                if self.config.cancel_on_timeout {
                                    handle.abort();
                                }
                                Err(PipelineError::Timeout {
                                    phase: TimeoutPhase::GraceExpired,
                                })
                            }
                        }
                    }
                }
            }
        }
    }

    fn classify_on_time<T>(&self, start: Instant, deadline: Duration, value: T) -> TimeoutOutcome<T> {
        let elapsed = start.elapsed().as_secs_f64();
        let deadline = deadline.as_secs_f64();
        if deadline > 0.0 && elapsed >= deadline * NEAR_TIMEOUT_THRESHOLD {
            self.events.record(Event::NearTimeout);
            TimeoutOutcome::NearTimeout(value)
        } else {
            TimeoutOutcome::OnTime(value)
        }
    }
}
