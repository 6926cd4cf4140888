//! Sliding-window rate limiter.
//!
//! Admission is decided under a short lock and never suspends the caller.
//! A background task prunes expired timestamps on `prune_interval`; it only
//! holds a weak reference and is aborted by [`RateLimiter::destroy`] or drop.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use cadence_config::{ConfigValidator, RateLimiterConfig};
use cadence_errors::{CadenceError, CadenceResult};
use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Admitted calls still inside the window.
    pub current: usize,
    pub limit: usize,
    pub window: Duration,
    pub remaining: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub destroyed: bool,
}

#[derive(Debug, Default)]
struct Window {
    admitted: VecDeque<Instant>,
    total_admitted: u64,
    total_rejected: u64,
    destroyed: bool,
}

impl Window {
    /// A timestamp leaves the window once its age reaches `window`.
    fn prune(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.admitted.len();
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        before - self.admitted.len()
    }
}

#[derive(Debug)]
struct LimiterInner {
    config: RateLimiterConfig,
    window: Mutex<Window>,
}

impl LimiterInner {
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Validates `config` and, when called inside a tokio runtime, starts the
    /// pruning task. Outside a runtime expired entries are still pruned on
    /// every admission check.
    pub fn new(config: RateLimiterConfig) -> CadenceResult<Self> {
        config.validate()?;
        let inner = Arc::new(LimiterInner {
            config,
            window: Mutex::new(Window::default()),
        });

        let pruner = Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(prune_loop(Arc::downgrade(&inner))));

        Ok(Self {
            inner,
            pruner: Mutex::new(pruner),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Records an admission if the window has room, without running anything.
    pub fn try_acquire(&self) -> CadenceResult<()> {
        let now = Instant::now();
        let config = &self.inner.config;
        let mut window = self.inner.lock();

        if window.destroyed {
            return Err(CadenceError::LimiterDestroyed);
        }

        window.prune(now, config.window);

        if window.admitted.len() < config.limit {
            window.admitted.push_back(now);
            window.total_admitted += 1;
            trace!(current = window.admitted.len(), limit = config.limit, "Call admitted");
            return Ok(());
        }

        window.total_rejected += 1;
        let retry_after = window
            .admitted
            .front()
            .map(|oldest| config.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or_default();
        counter!("cadence_rate_limiter_rejected_total").increment(1);
        debug!(limit = config.limit, ?retry_after, "Rate limit exceeded");

        Err(CadenceError::RateLimited {
            limit: config.limit,
            window: config.window,
            retry_after,
        })
    }

    /// Admits and runs `operation`, or fails fast without invoking it.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CadenceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        self.try_acquire()?;
        operation().await
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let config = &self.inner.config;
        let window = self.inner.lock();
        let current = window
            .admitted
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < config.window)
            .count();

        RateLimiterStats {
            current,
            limit: config.limit,
            window: config.window,
            remaining: config.limit.saturating_sub(current),
            total_admitted: window.total_admitted,
            total_rejected: window.total_rejected,
            destroyed: window.destroyed,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Stops the pruning task and rejects every later call. Idempotent.
    pub fn destroy(&self) {
        {
            let mut window = self.inner.lock();
            if !window.destroyed {
                debug!("Rate limiter destroyed");
            }
            window.destroyed = true;
            window.admitted.clear();
        }
        self.stop_pruner();
    }

    fn stop_pruner(&self) {
        let handle = self
            .pruner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop_pruner();
    }
}

async fn prune_loop(inner: Weak<LimiterInner>) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.prune_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut window = inner.lock();
        if window.destroyed {
            break;
        }
        let pruned = window.prune(Instant::now(), inner.config.window);
        if pruned > 0 {
            trace!(pruned, "Pruned expired rate limiter entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::advance;

    fn limiter(limit: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::new(limit, Duration::from_millis(window_ms))).unwrap()
    }

    fn retry_after(result: CadenceResult<()>) -> Duration {
        match result {
            Err(CadenceError::RateLimited { retry_after, .. }) => retry_after,
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_in_window_is_rejected() {
        let limiter = limiter(3, 2000);
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
        }
        assert_eq!(retry_after(limiter.try_acquire()), Duration::from_millis(2000));

        advance(Duration::from_millis(1999)).await;
        assert_eq!(retry_after(limiter.try_acquire()), Duration::from_millis(1));

        advance(Duration::from_millis(1)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_past_oldest_call() {
        let limiter = limiter(3, 2000);
        limiter.try_acquire().unwrap();
        advance(Duration::from_millis(500)).await;
        limiter.try_acquire().unwrap();
        advance(Duration::from_millis(500)).await;
        limiter.try_acquire().unwrap();

        advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire().is_err());

        // t = 2000: the call from t = 0 has left the window
        advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire().is_ok());

        // t = 2100: calls from 500, 1000 and 2000 are inside
        advance(Duration::from_millis(100)).await;
        assert_eq!(retry_after(limiter.try_acquire()), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_execute_does_not_invoke_operation() {
        let limiter = limiter(1, 1000);
        let invoked = AtomicU32::new(0);

        let first = limiter
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok("ran") }
            })
            .await;
        assert_eq!(first.unwrap(), "ran");

        let second = limiter
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok("ran") }
            })
            .await;
        assert!(second.unwrap_err().is_admission_rejection());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_failure_still_consumes_slot() {
        let limiter = limiter(1, 1000);
        let result: CadenceResult<()> = limiter
            .execute(|| async { Err(CadenceError::task_execution("failed")) })
            .await;
        assert!(matches!(result, Err(CadenceError::TaskExecution(_))));
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let limiter = limiter(3, 1000);
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.current, 2);
        assert_eq!(stats.remaining, 1);
        assert_eq!(stats.limit, 3);
        assert_eq!(stats.window, Duration::from_millis(1000));

        limiter.try_acquire().unwrap();
        limiter.try_acquire().ok();
        let stats = limiter.stats();
        assert_eq!(stats.total_admitted, 3);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.remaining, 0);

        advance(Duration::from_millis(1000)).await;
        assert_eq!(limiter.stats().current, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_clears_expired_entries() {
        let limiter = limiter(5, 100);
        for _ in 0..5 {
            limiter.try_acquire().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(limiter.inner.lock().admitted.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_rejects_later_calls() {
        let limiter = limiter(5, 1000);
        limiter.try_acquire().unwrap();
        limiter.destroy();
        limiter.destroy();

        assert!(limiter.is_destroyed());
        assert!(matches!(
            limiter.try_acquire(),
            Err(CadenceError::LimiterDestroyed)
        ));
        let result = limiter.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CadenceError::LimiterDestroyed)));
        assert!(limiter.pruner.lock().unwrap().is_none());

        let stats = limiter.stats();
        assert!(stats.destroyed);
        assert_eq!(stats.current, 0);
    }

    #[test]
    fn test_works_without_runtime() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.pruner.lock().unwrap().is_none());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn test_invalid_config() {
        let zero_limit = RateLimiter::new(RateLimiterConfig::new(0, Duration::from_secs(1)));
        assert!(zero_limit.unwrap_err().is_configuration_error());

        let zero_window = RateLimiter::new(RateLimiterConfig::new(1, Duration::ZERO));
        assert!(zero_window.is_err());
    }
}
