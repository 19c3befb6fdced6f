use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pipelinekit_types::{ConfigError, Event, EventSink, PipelineError};
use tracing::info;

/// Where the breaker sits in its Closed → Open → HalfOpen → Closed cycle.
///
/// See spec §4.3. `HalfOpen` is a projection: the breaker doesn't run a
/// background clock to flip `Open` to `HalfOpen` the instant the cooldown
/// elapses, it computes the projection lazily whenever a caller asks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Optional failure-rate trip condition layered on top of the plain
/// consecutive-failure counter, per spec §4.3. The breaker trips from
/// `Closed` if *either* condition fires first.
#[derive(Clone, Copy, Debug)]
pub struct RollingWindowConfig {
    /// How many of the most recent outcomes to retain.
    pub sample_size: usize,
    /// Minimum outcomes collected before the failure rate is evaluated at
    /// all — avoids tripping on a handful of cold-start samples.
    pub min_requests: usize,
    /// Trip once the observed failure rate reaches this fraction, in
    /// `[0.0, 1.0]`.
    pub failure_rate_threshold: f64,
}

impl RollingWindowConfig {
    pub fn new(
        sample_size: usize,
        min_requests: usize,
        failure_rate_threshold: f64,
    ) -> Result<Self, ConfigError> {
        if sample_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "sample_size",
                value: sample_size as i64,
            });
        }
        if min_requests == 0 || min_requests > sample_size {
            return Err(ConfigError::MustBePositive {
                field: "min_requests",
                value: min_requests as i64,
            });
        }
        if !(0.0..=1.0).contains(&failure_rate_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "failure_rate_threshold",
                value: failure_rate_threshold,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self {
            sample_size,
            min_requests,
            failure_rate_threshold,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before the breaker trips.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before admitting probes.
    pub open_duration: Duration,
    /// Concurrent probes allowed while `HalfOpen`.
    pub half_open_max_probes: u32,
    /// Consecutive probe successes required to close the breaker again.
    pub success_threshold: u32,
    /// If `Closed` sits idle (no failures) for this long, the consecutive
    /// failure count decays back to zero the next time a failure arrives,
    /// rather than accumulating across unrelated incidents.
    pub reset_window: Duration,
    /// Optional rolling failure-rate trip condition, evaluated alongside
    /// the consecutive-failure counter.
    pub rolling_window: Option<RollingWindowConfig>,
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: u32,
        open_duration: Duration,
        half_open_max_probes: u32,
        success_threshold: u32,
        reset_window: Duration,
        rolling_window: Option<RollingWindowConfig>,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::MustBePositive {
                field: "failure_threshold",
                value: failure_threshold as i64,
            });
        }
        if open_duration.is_zero() {
            return Err(ConfigError::DurationMustBePositive {
                field: "open_duration",
                value: open_duration,
            });
        }
        if half_open_max_probes == 0 {
            return Err(ConfigError::MustBePositive {
                field: "half_open_max_probes",
                value: half_open_max_probes as i64,
            });
        }
        if success_threshold == 0 {
            return Err(ConfigError::MustBePositive {
                field: "success_threshold",
                value: success_threshold as i64,
            });
        }
        if reset_window.is_zero() {
            return Err(ConfigError::DurationMustBePositive {
                field: "reset_window",
                value: reset_window,
            });
        }
        Ok(Self {
            failure_threshold,
            open_duration,
            half_open_max_probes,
            success_threshold,
            reset_window,
            rolling_window,
        })
    }
}

struct Internal {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_probes_in_flight: u32,
    half_open_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    samples: VecDeque<bool>,
}

/// Tracks the state a call was admitted under so its outcome is attributed
/// to the right transition, even if the breaker moves on in the meantime.
pub struct BreakerTicket {
    admitted_as: BreakerState,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    internal: Mutex<Internal>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            internal: Mutex::new(Internal {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probes_in_flight: 0,
                half_open_successes: 0,
                last_failure_at: None,
                samples: VecDeque::new(),
            }),
            events,
        }
    }

    /// Current state, projecting `Open` to `HalfOpen` once the cooldown has
    /// elapsed even if nothing has called through yet.
    pub fn state(&self) -> BreakerState {
        let internal = self.internal.lock();
        self.projected_state(&internal)
    }

    fn projected_state(&self, internal: &Internal) -> BreakerState {
        match internal.state {
            BreakerState::Open => {
                let reopen_at = internal.opened_at.expect("opened_at set while Open")
                    + chrono::Duration::from_std(self.config.open_duration)
                        .unwrap_or(chrono::Duration::MAX);
                if Utc::now() >= reopen_at {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            other => other,
        }
    }

    /// Admit a call, or reject it while the breaker is (still) open.
    pub fn before_call(&self) -> Result<BreakerTicket, PipelineError> {
        let mut internal = self.internal.lock();
        let projected = self.projected_state(&internal);

        match projected {
            BreakerState::Closed => Ok(BreakerTicket {
                admitted_as: BreakerState::Closed,
            }),
            BreakerState::Open => {
                self.events.record(Event::BreakerRejected);
                let until = internal.opened_at.expect("opened_at set while Open")
                    + chrono::Duration::from_std(self.config.open_duration)
                        .unwrap_or(chrono::Duration::MAX);
                Err(PipelineError::CircuitRejected { until })
            }
            BreakerState::HalfOpen => {
                if internal.state == BreakerState::Open {
                    // First caller to observe the elapsed cooldown performs
                    // the actual Open -> HalfOpen transition.
                    internal.state = BreakerState::HalfOpen;
                    internal.half_open_probes_in_flight = 0;
                    internal.half_open_successes = 0;
                    self.events.record(Event::BreakerStateChanged {
                        from: BreakerState::Open.name(),
                        to: BreakerState::HalfOpen.name(),
                    });
                    info!("circuit breaker entering half-open probe window");
                }
                if internal.half_open_probes_in_flight < self.config.half_open_max_probes {
                    internal.half_open_probes_in_flight += 1;
                    Ok(BreakerTicket {
                        admitted_as: BreakerState::HalfOpen,
                    })
                } else {
                    self.events.record(Event::BreakerRejected);
                    let until = internal.opened_at.expect("opened_at set while HalfOpen")
                        + chrono::Duration::from_std(self.config.open_duration)
                            .unwrap_or(chrono::Duration::MAX);
                    Err(PipelineError::CircuitRejected { until })
                }
            }
        }
    }

    pub fn record_success(&self, ticket: BreakerTicket) {
        let mut internal = self.internal.lock();
        match ticket.admitted_as {
            BreakerState::Closed => {
                internal.consecutive_failures = 0;
                internal.last_failure_at = None;
                if self.record_sample(&mut internal, true) {
                    self.trip(&mut internal, BreakerState::Closed);
                }
            }
            BreakerState::HalfOpen => {
                internal.half_open_probes_in_flight =
                    internal.half_open_probes_in_flight.saturating_sub(1);
                internal.half_open_successes += 1;
                if internal.half_open_successes >= self.config.success_threshold {
                    internal.state = BreakerState::Closed;
                    internal.consecutive_failures = 0;
                    internal.opened_at = None;
                    internal.last_failure_at = None;
                    self.events.record(Event::BreakerStateChanged {
                        from: BreakerState::HalfOpen.name(),
                        to: BreakerState::Closed.name(),
                    });
                    info!("circuit breaker closed after successful probes");
                }
            }
            BreakerState::Open => unreachable!("before_call never admits while Open"),
        }
    }

    pub fn record_failure(&self, ticket: BreakerTicket) {
        let mut internal = self.internal.lock();
        match ticket.admitted_as {
            BreakerState::Closed => {
                let now = Utc::now();
                let idle_elapsed = internal.last_failure_at.is_some_and(|last| {
                    now >= last
                        + chrono::Duration::from_std(self.config.reset_window)
                            .unwrap_or(chrono::Duration::MAX)
                });
                if idle_elapsed {
                    internal.consecutive_failures = 0;
                }
                internal.consecutive_failures += 1;
                internal.last_failure_at = Some(now);
                let rolling_tripped = self.record_sample(&mut internal, false);
                if internal.consecutive_failures >= self.config.failure_threshold || rolling_tripped
                {
                    self.trip(&mut internal, BreakerState::Closed);
                }
            }
            BreakerState::HalfOpen => {
                internal.half_open_probes_in_flight =
                    internal.half_open_probes_in_flight.saturating_sub(1);
                self.trip(&mut internal, BreakerState::HalfOpen);
            }
            BreakerState::Open => unreachable!("before_call never admits while Open"),
        }
    }

    /// Push an outcome into the rolling window and report whether the
    /// configured failure-rate threshold is now crossed. A no-op (always
    /// `false`) when no rolling window is configured.
    fn record_sample(&self, internal: &mut Internal, success: bool) -> bool {
        let Some(window) = self.config.rolling_window else {
            return false;
        };
        internal.samples.push_back(success);
        while internal.samples.len() > window.sample_size {
            internal.samples.pop_front();
        }
        if internal.samples.len() < window.min_requests {
            return false;
        }
        let failures = internal.samples.iter().filter(|s| !**s).count();
        let rate = failures as f64 / internal.samples.len() as f64;
        rate >= window.failure_rate_threshold
    }

    fn trip(&self, internal: &mut Internal, from: BreakerState) {
        internal.state = BreakerState::Open;
        internal.opened_at = Some(Utc::now());
        internal.half_open_successes = 0;
        self.events.record(Event::BreakerStateChanged {
            from: from.name(),
            to: BreakerState::Open.name(),
        });
        info!(from = from.name(), "circuit breaker tripped open");
    }

    /// Run `op` through the breaker: admits, awaits, and records the
    /// outcome in one step. Prefer `before_call`/`record_*` directly when
    /// the caller needs finer control over when the outcome is known.
    pub async fn call<F, T, E>(&self, op: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let ticket = self.before_call()?;
        match op.await {
            Ok(value) => {
                self.record_success(ticket);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(ticket);
                Err(PipelineError::wrap(err))
            }
        }
    }
}
