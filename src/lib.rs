//! Cadence: 进程内任务调度与弹性原语
//!
//! 各子crate的门面，常用类型在此统一导出。

pub mod common;

pub use cadence_config as config;
pub use cadence_dispatcher as dispatcher;
pub use cadence_errors as errors;
pub use cadence_infrastructure as infrastructure;

pub use cadence_config::{AppConfig, LogConfig};
pub use cadence_dispatcher::{CronExpression, Scheduler, ScheduledTaskInfo, TaskOptions};
pub use cadence_errors::{CadenceError, CadenceResult};
pub use cadence_infrastructure::{
    retry, with_timeout, CircuitBreaker, RateLimiter, RetryPolicy, TaskHandle, TaskQueue,
};
