//! 进程内任务调度器
//!
//! 单个周期性 tick 扫描所有已启用且到期的任务，并把每次执行派发到独立的
//! tokio 任务上，tick 本身从不等待任务完成。同一任务同一时刻至多一个执行实例。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_config::{ConfigValidator, SchedulerConfig};
use cadence_errors::{CadenceError, CadenceResult};
use cadence_infrastructure::TaskQueue;

use crate::clock::{Clock, SystemClock};
use crate::cron_utils::CronExpression;

/// 被调度执行的工作单元
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> CadenceResult<()>;
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CadenceResult<()>> + Send + 'static,
{
    async fn run(&self) -> CadenceResult<()> {
        (self)().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronExpression),
    Every(Duration),
    At(DateTime<Utc>),
}

impl Schedule {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::At(_))
    }

    fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(cron) => cron.next_after(now),
            Schedule::Every(every) => advance(now, *every),
            Schedule::At(at) => Some(*at),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(cron) => write!(f, "cron({cron})"),
            Schedule::Every(every) => write!(f, "every({every:?})"),
            Schedule::At(at) => write!(f, "at({})", at.to_rfc3339()),
        }
    }
}

/// 注册任务时的可选项
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub name: Option<String>,
    /// 通过任务队列执行时使用的优先级
    pub priority: i32,
    pub enabled: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            priority: 0,
            enabled: true,
        }
    }
}

impl TaskOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// 任务的时间点快照
#[derive(Debug, Clone)]
pub struct ScheduledTaskInfo {
    pub id: Uuid,
    pub name: Option<String>,
    pub schedule: Schedule,
    pub priority: i32,
    pub next_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub failure_count: u64,
}

struct ScheduledTask {
    seq: u64,
    name: Option<String>,
    schedule: Schedule,
    job: Arc<dyn Job>,
    priority: i32,
    next_run: Option<DateTime<Utc>>,
    enabled: bool,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    run_count: u64,
    failure_count: u64,
}

impl ScheduledTask {
    fn info(&self, id: Uuid) -> ScheduledTaskInfo {
        ScheduledTaskInfo {
            id,
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            priority: self.priority,
            next_run: self.next_run,
            enabled: self.enabled,
            running: self.running,
            last_run: self.last_run,
            last_error: self.last_error.clone(),
            run_count: self.run_count,
            failure_count: self.failure_count,
        }
    }

    fn label(&self, id: Uuid) -> String {
        match &self.name {
            Some(name) => format!("{name} ({id})"),
            None => id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Scheduled,
    Manual,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<Uuid, ScheduledTask>,
    next_seq: u64,
}

/// 可廉价克隆，克隆共享同一注册表与 tick 循环
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<RwLock<Registry>>,
    clock: Arc<dyn Clock>,
    queue: Option<TaskQueue<()>>,
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("queue", &self.queue)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> CadenceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(RwLock::new(Registry::default())),
            clock: Arc::new(SystemClock),
            queue: None,
            shutdown_tx: Arc::new(Mutex::new(None)),
        })
    }

    /// 通过任务队列执行任务体，以队列的并发上限约束执行；需在 `start` 之前设置
    pub fn with_queue(mut self, queue: TaskQueue<()>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// 替换时间来源；需在注册任务之前设置
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 注册由CRON表达式驱动的周期任务，表达式无效时立即返回错误
    pub async fn schedule<J: Job + 'static>(
        &self,
        cron_expr: &str,
        job: J,
        options: TaskOptions,
    ) -> CadenceResult<Uuid> {
        let cron = CronExpression::parse(cron_expr)?;
        self.register(Schedule::Cron(cron), Arc::new(job), options)
            .await
    }

    /// 注册固定间隔的周期任务
    pub async fn every<J: Job + 'static>(
        &self,
        every: Duration,
        job: J,
        options: TaskOptions,
    ) -> CadenceResult<Uuid> {
        if every.is_zero() {
            return Err(CadenceError::config_error("执行间隔必须大于0"));
        }
        if advance(self.clock.now(), every).is_none() {
            return Err(CadenceError::config_error(format!(
                "执行间隔 {every:?} 超出可表示的时间范围"
            )));
        }
        self.register(Schedule::Every(every), Arc::new(job), options)
            .await
    }

    /// 注册在指定时间执行一次的任务，执行后 (无论成败) 从注册表移除
    pub async fn at<J: Job + 'static>(
        &self,
        at: DateTime<Utc>,
        job: J,
        options: TaskOptions,
    ) -> CadenceResult<Uuid> {
        self.register(Schedule::At(at), Arc::new(job), options).await
    }

    async fn register(
        &self,
        schedule: Schedule,
        job: Arc<dyn Job>,
        options: TaskOptions,
    ) -> CadenceResult<Uuid> {
        let id = Uuid::new_v4();
        let next_run = schedule.first_run(self.clock.now());
        if next_run.is_none() {
            warn!("任务 {} 的调度 {} 没有可执行的时间点", id, schedule);
        }

        let mut registry = self.registry.write().await;
        let seq = registry.next_seq;
        registry.next_seq += 1;

        info!(
            "注册任务 {}: 调度={}, 下次执行={:?}",
            options.name.as_deref().unwrap_or("<unnamed>"),
            schedule,
            next_run
        );

        registry.tasks.insert(
            id,
            ScheduledTask {
                seq,
                name: options.name,
                schedule,
                job,
                priority: options.priority,
                next_run,
                enabled: options.enabled,
                running: false,
                last_run: None,
                last_error: None,
                run_count: 0,
                failure_count: 0,
            },
        );
        gauge!("cadence_scheduler_tasks").set(registry.tasks.len() as f64);
        Ok(id)
    }

    /// 恢复调度；若保存的下次执行时间已过，周期任务重新计算，单次任务保持到期
    pub async fn enable(&self, id: Uuid) -> CadenceResult<()> {
        let now = self.clock.now();
        let mut registry = self.registry.write().await;
        let task = registry
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CadenceError::task_not_found(id))?;

        task.enabled = true;
        if task.schedule.is_recurring() && task.next_run.is_some_and(|next| next < now) {
            task.next_run = task.schedule.first_run(now);
            debug!("任务 {} 的下次执行时间已过，重新计算为 {:?}", id, task.next_run);
        }
        Ok(())
    }

    /// 停止后续派发，保留任务及其下次执行时间；不中断正在进行的执行
    pub async fn disable(&self, id: Uuid) -> CadenceResult<()> {
        let mut registry = self.registry.write().await;
        let task = registry
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CadenceError::task_not_found(id))?;
        task.enabled = false;
        Ok(())
    }

    /// 从注册表移除任务；正在进行的执行会完成，但其结果被丢弃
    pub async fn cancel(&self, id: Uuid) -> CadenceResult<()> {
        let mut registry = self.registry.write().await;
        let task = registry
            .tasks
            .remove(&id)
            .ok_or_else(|| CadenceError::task_not_found(id))?;
        info!("取消任务 {}", task.label(id));
        gauge!("cadence_scheduler_tasks").set(registry.tasks.len() as f64);
        Ok(())
    }

    /// 立即手动执行一次并等待结果，不影响下次执行时间；任务正在运行时返回错误
    pub async fn run(&self, id: Uuid) -> CadenceResult<()> {
        let (job, priority) = {
            let mut registry = self.registry.write().await;
            let task = registry
                .tasks
                .get_mut(&id)
                .ok_or_else(|| CadenceError::task_not_found(id))?;
            if task.running {
                return Err(CadenceError::TaskAlreadyRunning { id: id.to_string() });
            }
            task.running = true;
            (task.job.clone(), task.priority)
        };

        debug!("手动执行任务 {}", id);
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .execute(id, job, priority, RunKind::Manual)
                .await
        })
        .await
        .map_err(|e| CadenceError::Internal(format!("手动执行任务 {id} 失败: {e}")))?
    }

    pub async fn task(&self, id: Uuid) -> Option<ScheduledTaskInfo> {
        let registry = self.registry.read().await;
        registry.tasks.get(&id).map(|task| task.info(id))
    }

    /// 按注册顺序返回所有任务的快照
    pub async fn tasks(&self) -> Vec<ScheduledTaskInfo> {
        let registry = self.registry.read().await;
        let mut tasks: Vec<(u64, ScheduledTaskInfo)> = registry
            .tasks
            .iter()
            .map(|(id, task)| (task.seq, task.info(*id)))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, info)| info).collect()
    }

    /// 启动 tick 循环；已启动时直接返回
    pub fn start(&self) -> CadenceResult<()> {
        let handle = Handle::try_current()
            .map_err(|_| CadenceError::Internal("调度器需要在tokio运行时中启动".to_string()))?;

        let mut shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shutdown_tx.is_some() {
            debug!("调度器已在运行");
            return Ok(());
        }

        let (tx, mut shutdown_rx) = broadcast::channel(1);
        *shutdown_tx = Some(tx);

        let scheduler = self.clone();
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("调度循环已停止");
                        break;
                    }
                }
            }
        });

        info!("调度器已启动, tick间隔: {:?}", self.config.tick_interval);
        Ok(())
    }

    /// 停止 tick 循环，正在进行的执行不受影响
    pub fn stop(&self) {
        let sender = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
            info!("停止调度器");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 派发所有已启用、到期且未在运行的任务
    async fn tick(&self) {
        let now = self.clock.now();
        let due: Vec<(Uuid, Arc<dyn Job>, i32)> = {
            let mut registry = self.registry.write().await;
            registry
                .tasks
                .iter_mut()
                .filter(|(_, task)| task.enabled && task.next_run.is_some_and(|next| next <= now))
                .filter_map(|(id, task)| {
                    if task.running {
                        debug!("任务 {} 仍在运行，跳过本次调度", task.label(*id));
                        counter!("cadence_scheduler_skipped_total").increment(1);
                        return None;
                    }
                    task.running = true;
                    Some((*id, task.job.clone(), task.priority))
                })
                .collect()
        };

        for (id, job, priority) in due {
            debug!("派发到期任务 {}", id);
            let scheduler = self.clone();
            tokio::spawn(async move {
                // 结果已记录在注册表中
                let _ = scheduler
                    .execute(id, job, priority, RunKind::Scheduled)
                    .await;
            });
        }
    }

    async fn execute(
        &self,
        id: Uuid,
        job: Arc<dyn Job>,
        priority: i32,
        kind: RunKind,
    ) -> CadenceResult<()> {
        let started_at = self.clock.now();

        let result = match &self.queue {
            Some(queue) => {
                queue
                    .add_with_priority(priority, move || async move { job.run().await })
                    .await
            }
            None => AssertUnwindSafe(async move { job.run().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CadenceError::task_execution(format!("任务 {id} 发生panic")))),
        };

        self.settle(id, started_at, &result, kind).await;
        result
    }

    async fn settle(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        result: &CadenceResult<()>,
        kind: RunKind,
    ) {
        let mut registry = self.registry.write().await;
        let Some(task) = registry.tasks.get_mut(&id) else {
            debug!("任务 {} 已被取消，丢弃执行结果", id);
            return;
        };

        task.running = false;
        task.last_run = Some(started_at);
        task.run_count += 1;
        match result {
            Ok(()) => {
                task.last_error = None;
                counter!("cadence_scheduler_runs_total", "outcome" => "success").increment(1);
                debug!("任务 {} 执行成功", task.label(id));
            }
            Err(error) => {
                task.last_error = Some(error.to_string());
                task.failure_count += 1;
                counter!("cadence_scheduler_runs_total", "outcome" => "failure").increment(1);
                warn!("任务 {} 执行失败: {}", task.label(id), error);
            }
        }

        if kind == RunKind::Manual {
            return;
        }

        let next_run = match &task.schedule {
            Schedule::Cron(cron) => Some(cron.next_after(self.clock.now())),
            Schedule::Every(every) => Some(advance(started_at, *every)),
            Schedule::At(_) => None,
        };
        match next_run {
            Some(next_run) => task.next_run = next_run,
            None => {
                let label = task.label(id);
                registry.tasks.remove(&id);
                debug!("单次任务 {} 已执行，从注册表移除", label);
                gauge!("cadence_scheduler_tasks").set(registry.tasks.len() as f64);
            }
        }
    }
}

/// `at + every`，超出 chrono 可表示范围时返回 `None`
fn advance(at: DateTime<Utc>, every: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(every)
        .ok()
        .and_then(|every| at.checked_add_signed(every))
}
