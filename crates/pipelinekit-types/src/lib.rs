pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod metrics;
pub mod priority;

pub use command::Command;
pub use context::{Context, SharedContext};
pub use error::{BackPressureReason, PipelineError, TimeoutPhase};
pub use event::{Event, EventSink, NoopEventSink};
pub use metrics::{MetricsSink, NoopMetricsSink};
pub use priority::MiddlewarePriority;
