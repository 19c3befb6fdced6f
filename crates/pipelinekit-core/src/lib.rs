pub mod backpressure;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod retry;
pub mod semaphore;
pub mod timeout;

pub use backpressure::{AdmissionStrategy, BackpressureRegulator, BackpressureStats};
pub use bulkhead::{Admission, Bulkhead, BulkheadError, FallbackValue, RejectionPolicy};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, RollingWindowConfig};
pub use retry::{DelayStrategy, RetryConfig, RetryController, RetryError};
pub use semaphore::{AsyncSemaphore, Permit, SemaphoreError};
pub use timeout::{TimeoutConfig, TimeoutController, TimeoutOutcome, TimeoutResolver};
