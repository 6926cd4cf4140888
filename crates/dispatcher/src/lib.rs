//! Cron解析与进程内任务调度

pub mod clock;
pub mod cron_utils;
pub mod scheduler;

pub use clock::{Clock, SystemClock, TokioClock};
pub use cron_utils::CronExpression;
pub use scheduler::{Job, Schedule, ScheduledTaskInfo, Scheduler, TaskOptions};
