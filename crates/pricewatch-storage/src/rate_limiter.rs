//! Permit-based limiter for outbound retailer calls.
//!
//! Holds at most `max_permits` permits outstanding. Callers that find the pool
//! empty wait in FIFO order; a released permit goes straight to the oldest
//! waiter instead of back into the pool, so late arrivals cannot overtake.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Permit release delay used against the production API.
pub const DEFAULT_PERMIT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_permits: usize,
    pub cooldown: Duration,
}

impl RateLimiterConfig {
    pub fn new(max_permits: usize) -> Self {
        Self {
            max_permits,
            cooldown: DEFAULT_PERMIT_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct LimiterState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_permits: usize,
    cooldown: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let max_permits = config.max_permits.max(1);
        debug!(max_permits, cooldown_ms = config.cooldown.as_millis() as u64, "rate limiter initialized");
        Self {
            max_permits,
            cooldown: config.cooldown,
            state: Mutex::new(LimiterState {
                available: max_permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    /// Number of callers parked in the queue.
    pub fn waiting(&self) -> usize {
        self.lock_state().waiters.len()
    }

    /// Waits until a permit is granted. Callers must pair this with `release`.
    pub async fn acquire(&self) {
        let rx = {
            let mut state = self.lock_state();
            if state.available > 0 {
                state.available -= 1;
                debug!(remaining = state.available, "permit acquired immediately");
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(queue_len = state.waiters.len(), "no permits available, queuing");
            rx
        };

        let mut pending = PendingPermit {
            limiter: self,
            rx,
            granted: false,
        };
        if (&mut pending.rx).await.is_ok() {
            pending.granted = true;
        }
    }

    /// Returns a permit, handing it to the oldest live waiter if there is one.
    pub fn release(&self) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                debug!(queue_len = state.waiters.len(), "permit handed to queued caller");
                return;
            }
        }
        if state.available >= self.max_permits {
            warn!("release without a matching acquire ignored");
            return;
        }
        state.available += 1;
        debug!(available = state.available, "permit returned to pool");
    }

    /// Acquires a permit and schedules its release after the configured cooldown.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn acquire_with_cooldown(self: &Arc<Self>) {
        self.acquire().await;
        let limiter = Arc::clone(self);
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            limiter.release();
        });
    }
}

/// Hands a permit back if the waiting future is dropped after it was granted.
struct PendingPermit<'a> {
    limiter: &'a RateLimiter,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingPermit<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.limiter.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn first_n_acquire_immediately_rest_queue_in_order() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(2)));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for id in 0..3 {
            let task_limiter = Arc::clone(&limiter);
            let tx = tx.clone();
            tokio::spawn(async move {
                task_limiter.acquire().await;
                let _ = tx.send(id);
            });
            while limiter.waiting() < id + 1 {
                settle().await;
            }
        }
        settle().await;
        assert!(rx.try_recv().is_err(), "queued callers must not proceed before release");

        let mut order = Vec::new();
        for _ in 0..3 {
            limiter.release();
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn release_hands_off_before_returning_to_pool() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1)));
        limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        while limiter.waiting() == 0 {
            settle().await;
        }
        limiter.release();
        waiter.await.unwrap();
        assert_eq!(limiter.available(), 0);

        limiter.release();
        assert_eq!(limiter.available(), 1);
        limiter.release();
        assert_eq!(limiter.available(), 1, "pool never exceeds max permits");
    }

    #[tokio::test]
    async fn dropped_waiter_is_skipped() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1)));
        limiter.acquire().await;

        let abandoned = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        while limiter.waiting() == 0 {
            settle().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        limiter.release();
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn cooldown_releases_permit_later() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::new(1).with_cooldown(Duration::from_millis(80)),
        ));
        let started = Instant::now();
        limiter.acquire_with_cooldown().await;
        limiter.acquire_with_cooldown().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
