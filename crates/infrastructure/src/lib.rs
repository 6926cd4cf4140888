//! Resilience and execution primitives: retry with backoff, circuit breaker,
//! sliding-window rate limiter and a priority task queue.

pub mod backoff;
pub mod circuit_breaker;
pub mod events;
pub mod rate_limiter;
pub mod retry;
pub mod task_queue;
pub mod timeout_handler;

pub use backoff::{add_jitter, Backoff, DelayCalculator};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
pub use events::{EventBus, EventHandler, EventKind, QueueEvent, Subscription};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use retry::{retry, OnRetry, RetryPolicy, RetryPredicate};
pub use task_queue::{QueueStats, TaskHandle, TaskId, TaskInfo, TaskQueue, TaskState};
pub use timeout_handler::with_timeout;
