//! Priority, concurrency-bounded task queue.
//!
//! Pending tasks are admitted in descending priority, FIFO among equal
//! priorities, whenever fewer than `concurrency` tasks are running. Each admitted
//! task runs on its own tokio task; a failure or panic settles only that task.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use cadence_config::{ConfigValidator, QueueConfig};
use cadence_errors::{CadenceError, CadenceResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::events::{panic_message, EventBus, EventKind, QueueEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Done,
            _ => TaskState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Done => 2,
            TaskState::Failed => 3,
        }
    }
}

/// Derived counts; `size` is pending plus running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Snapshot of a task still owned by the queue.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub priority: i32,
    pub state: TaskState,
    pub enqueued_at: Instant,
}

type Job<T> = Box<dyn FnOnce() -> BoxFuture<'static, CadenceResult<T>> + Send>;

struct PendingTask<T> {
    id: TaskId,
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    job: Job<T>,
    state: Arc<AtomicU8>,
    sender: oneshot::Sender<CadenceResult<T>>,
}

impl<T> PartialEq for PendingTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for PendingTask<T> {}

impl<T> PartialOrd for PendingTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PendingTask<T> {
    // Max-heap: higher priority first, then the earlier sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RunningTask {
    priority: i32,
    enqueued_at: Instant,
}

struct QueueState<T> {
    pending: BinaryHeap<PendingTask<T>>,
    running: HashMap<TaskId, RunningTask>,
    completed: u64,
    failed: u64,
    paused: bool,
    next_seq: u64,
}

impl<T> QueueState<T> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.pending.len() + self.running.len(),
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed,
            failed: self.failed,
        }
    }
}

struct QueueInner<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    events: EventBus<T>,
    idle: Notify,
    next_id: AtomicU64,
    dispatch_scheduled: AtomicBool,
}

/// Cheap to clone; clones share the same queue.
pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("concurrency", &self.inner.config.concurrency)
            .field("stats", &self.lock().stats())
            .finish()
    }
}

impl<T> TaskQueue<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(config: QueueConfig) -> CadenceResult<Self> {
        config.validate()?;
        let paused = !config.autostart;
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    pending: BinaryHeap::new(),
                    running: HashMap::new(),
                    completed: 0,
                    failed: 0,
                    paused,
                    next_seq: 0,
                }),
                events: EventBus::new(),
                idle: Notify::new(),
                next_id: AtomicU64::new(1),
                dispatch_scheduled: AtomicBool::new(false),
            }),
        })
    }

    pub fn with_concurrency(concurrency: usize) -> CadenceResult<Self> {
        Self::new(QueueConfig::with_concurrency(concurrency))
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    /// Enqueues `task` with priority 0.
    pub fn add<F, Fut>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CadenceResult<T>> + Send + 'static,
    {
        self.add_with_priority(0, task)
    }

    /// Enqueues `task`; higher priorities are admitted first. Admission happens
    /// on a spawned step, so tasks added back to back are ordered by priority
    /// before any of them starts.
    pub fn add_with_priority<F, Fut>(&self, priority: i32, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CadenceResult<T>> + Send + 'static,
    {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(TaskState::Pending.as_u8()));

        {
            let mut queue = self.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.pending.push(PendingTask {
                id,
                priority,
                seq,
                enqueued_at: Instant::now(),
                job: Box::new(move || task().boxed()),
                state: state.clone(),
                sender,
            });
            trace!(%id, priority, pending = queue.pending.len(), "Task enqueued");
        }

        self.schedule_dispatch();

        TaskHandle {
            id,
            state,
            receiver,
        }
    }

    fn schedule_dispatch(&self) {
        let Ok(handle) = Handle::try_current() else {
            debug!("No tokio runtime, task stays pending until the next dispatch");
            return;
        };
        if self.inner.dispatch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.clone();
        handle.spawn(async move {
            queue.inner.dispatch_scheduled.store(false, Ordering::Release);
            queue.dispatch();
        });
    }

    /// Admits pending tasks into free running slots.
    fn dispatch(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let admitted = {
            let mut queue = self.lock();
            if queue.paused {
                return;
            }
            let mut admitted = Vec::new();
            while queue.running.len() < self.inner.config.concurrency {
                let Some(task) = queue.pending.pop() else {
                    break;
                };
                queue.running.insert(
                    task.id,
                    RunningTask {
                        priority: task.priority,
                        enqueued_at: task.enqueued_at,
                    },
                );
                task.state.store(TaskState::Running.as_u8(), Ordering::Release);
                admitted.push(task);
            }
            gauge!("cadence_queue_running").set(queue.running.len() as f64);
            gauge!("cadence_queue_pending").set(queue.pending.len() as f64);
            admitted
        };

        for task in admitted {
            debug!(id = %task.id, priority = task.priority, "Task admitted");
            let queue = self.clone();
            handle.spawn(async move {
                let PendingTask {
                    id,
                    job,
                    state,
                    sender,
                    ..
                } = task;
                let outcome = AssertUnwindSafe(async move { job().await })
                    .catch_unwind()
                    .await;
                let result = outcome.unwrap_or_else(|panic| {
                    Err(CadenceError::task_execution(format!(
                        "任务 {id} 发生panic: {}",
                        panic_message(panic.as_ref())
                    )))
                });
                queue.settle(id, &state, sender, result);
            });
        }
    }

    fn settle(
        &self,
        id: TaskId,
        state: &AtomicU8,
        sender: oneshot::Sender<CadenceResult<T>>,
        result: CadenceResult<T>,
    ) {
        let became_idle = {
            let mut queue = self.lock();
            queue.running.remove(&id);
            match &result {
                Ok(_) => queue.completed += 1,
                Err(_) => queue.failed += 1,
            }
            queue.is_idle()
        };

        match &result {
            Ok(value) => {
                state.store(TaskState::Done.as_u8(), Ordering::Release);
                counter!("cadence_queue_tasks_completed_total").increment(1);
                trace!(%id, "Task completed");
                self.inner
                    .events
                    .emit(&QueueEvent::TaskComplete { id, result: value });
            }
            Err(error) => {
                state.store(TaskState::Failed.as_u8(), Ordering::Release);
                counter!("cadence_queue_tasks_failed_total").increment(1);
                warn!(%id, %error, "Task failed");
                self.inner
                    .events
                    .emit(&QueueEvent::TaskError { id, error });
            }
        }

        self.dispatch();

        // The caller may have dropped its handle.
        let _ = sender.send(result);

        if became_idle {
            self.notify_idle();
        }
    }

    fn notify_idle(&self) {
        debug!("Task queue is idle");
        self.inner.events.emit(&QueueEvent::Idle);
        self.inner.idle.notify_waiters();
    }

    /// Resolves once nothing is pending or running; at once if already idle.
    pub async fn on_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops admitting pending tasks. Running tasks are not interrupted.
    pub fn pause(&self) {
        self.lock().paused = true;
        debug!("Task queue paused");
    }

    pub fn start(&self) {
        {
            let mut queue = self.lock();
            if !queue.paused {
                return;
            }
            queue.paused = false;
        }
        debug!("Task queue started");
        self.dispatch();
    }

    /// Drops every pending task; their handles resolve with
    /// [`CadenceError::TaskCancelled`]. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let (dropped, became_idle) = {
            let mut queue = self.lock();
            let dropped: Vec<PendingTask<T>> = queue.pending.drain().collect();
            (dropped, queue.running.is_empty())
        };
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            debug!(count, "Cleared pending tasks");
            if became_idle {
                self.notify_idle();
            }
        }
        count
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&QueueEvent<'_, T>) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Pending plus running.
    pub fn size(&self) -> usize {
        self.lock().stats().size
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn running(&self) -> usize {
        self.lock().running.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    /// Running tasks followed by pending ones in admission order.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let queue = self.lock();
        let mut running: Vec<TaskInfo> = queue
            .running
            .iter()
            .map(|(id, task)| TaskInfo {
                id: *id,
                priority: task.priority,
                state: TaskState::Running,
                enqueued_at: task.enqueued_at,
            })
            .collect();
        running.sort_by_key(|info| info.id);

        let mut pending: Vec<&PendingTask<T>> = queue.pending.iter().collect();
        pending.sort_by(|a, b| b.cmp(a));

        running.extend(pending.into_iter().map(|task| TaskInfo {
            id: task.id,
            priority: task.priority,
            state: TaskState::Pending,
            enqueued_at: task.enqueued_at,
        }));
        running
    }
}

/// Resolves with the task's own result. Dropping the handle does not cancel
/// the task.
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<T> {
    id: TaskId,
    state: Arc<AtomicU8>,
    receiver: oneshot::Receiver<CadenceResult<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = CadenceResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(CadenceError::TaskCancelled { id: id.to_string() })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    fn paused_queue<T: Send + 'static>(concurrency: usize) -> TaskQueue<T> {
        TaskQueue::new(QueueConfig::with_concurrency(concurrency).paused()).unwrap()
    }

    #[tokio::test]
    async fn test_priority_order_with_paused_queue() {
        let queue = paused_queue::<i32>(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for priority in [1, 10, 5, 100] {
            let order = order.clone();
            let _ = queue.add_with_priority(priority, move || async move {
                order.lock().unwrap().push(priority);
                Ok(priority)
            });
        }
        assert_eq!(queue.pending(), 4);
        assert_eq!(queue.running(), 0);

        queue.start();
        queue.on_idle().await;
        assert_eq!(*order.lock().unwrap(), vec![100, 10, 5, 1]);
    }

    #[tokio::test]
    async fn test_priority_order_with_back_to_back_adds() {
        let queue = TaskQueue::<i32>::with_concurrency(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = [1, 10, 5, 100]
            .into_iter()
            .map(|priority| {
                let order = order.clone();
                queue.add_with_priority(priority, move || async move {
                    order.lock().unwrap().push(priority);
                    Ok(priority)
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![100, 10, 5, 1]);
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let queue = paused_queue::<usize>(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let order = order.clone();
            let _ = queue.add(move || async move {
                order.lock().unwrap().push(n);
                Ok(n)
            });
        }
        queue.start();
        queue.on_idle().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound_is_never_exceeded() {
        let queue = TaskQueue::<()>::with_concurrency(3).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let active = active.clone();
            let peak = peak.clone();
            let _ = queue.add(move || async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            assert!(queue.running() <= 3);
        }

        queue.on_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().completed, 20);
    }

    async fn explode() -> CadenceResult<u32> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_failure_and_panic_are_isolated() {
        let queue = TaskQueue::<u32>::with_concurrency(1).unwrap();

        let failing = queue.add_with_priority(3, || async {
            Err(CadenceError::task_execution("broken"))
        });
        let panicking = queue.add_with_priority(2, explode);
        let healthy = queue.add_with_priority(1, || async { Ok(9) });

        assert!(matches!(failing.await, Err(CadenceError::TaskExecution(_))));
        let panic_error = panicking.await.unwrap_err();
        assert!(panic_error.to_string().contains("kaboom"));
        assert_eq!(healthy.await.unwrap(), 9);

        queue.on_idle().await;
        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_on_idle_resolves_immediately_when_idle() {
        let queue = TaskQueue::<()>::with_concurrency(2).unwrap();
        tokio::time::timeout(Duration::from_millis(50), queue.on_idle())
            .await
            .expect("idle queue should resolve at once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_idle_waits_for_running_tasks() {
        let queue = TaskQueue::<()>::with_concurrency(2).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        for delay in [10, 30] {
            let finished = finished.clone();
            let _ = queue.add(move || async move {
                sleep(Duration::from_millis(delay)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queue.on_idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(queue.is_idle());

        // re-armed by a new task
        let _ = queue.add(|| async {
            sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        assert!(!queue.is_idle());
        queue.on_idle().await;
        assert_eq!(queue.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let queue = TaskQueue::<u32>::with_concurrency(1).unwrap();
        let completed = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let idles = Arc::new(AtomicUsize::new(0));

        let sink = completed.clone();
        let _on_complete = queue.subscribe(EventKind::TaskComplete, move |event| {
            if let QueueEvent::TaskComplete { result, .. } = event {
                sink.lock().unwrap().push(**result);
            }
        });
        let counter = errors.clone();
        let _on_error = queue.subscribe(EventKind::TaskError, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = idles.clone();
        let _on_idle = queue.subscribe(EventKind::Idle, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = queue.add(|| async { Ok(1) });
        let b = queue.add(|| async { Err(CadenceError::task_execution("no")) });
        let c = queue.add(|| async { Ok(3) });
        let _ = (a.await, b.await, c.await);
        queue.on_idle().await;

        assert_eq!(*completed.lock().unwrap(), vec![1, 3]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(idles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_tasks() {
        let queue = paused_queue::<()>(1);
        let first = queue.add(|| async { Ok(()) });
        let second = queue.add(|| async { Ok(()) });

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.size(), 0);
        assert!(matches!(
            first.await,
            Err(CadenceError::TaskCancelled { .. })
        ));
        assert!(second.await.is_err());
        queue.on_idle().await;
    }

    #[tokio::test]
    async fn test_pause_holds_pending_tasks() {
        let queue = TaskQueue::<u8>::with_concurrency(1).unwrap();
        queue.pause();
        assert!(queue.is_paused());

        let handle = queue.add(|| async { Ok(1) });
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), TaskState::Pending);
        assert_eq!(queue.pending(), 1);

        let snapshot = queue.tasks();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, TaskState::Pending);
        assert_eq!(snapshot[0].id, handle.id());

        queue.start();
        assert!(!queue.is_paused());
        let state = handle.state.clone();
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(TaskState::from_u8(state.load(Ordering::Acquire)), TaskState::Done);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let queue = paused_queue::<()>(2);
        for priority in 0..3 {
            let _ = queue.add_with_priority(priority, || async { Ok(()) });
        }
        assert_eq!(
            queue.stats(),
            QueueStats {
                size: 3,
                pending: 3,
                running: 0,
                completed: 0,
                failed: 0,
            }
        );
        let priorities: Vec<i32> = queue.tasks().iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![2, 1, 0]);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = TaskQueue::<()>::with_concurrency(0);
        assert!(result.unwrap_err().is_configuration_error());
    }
}
