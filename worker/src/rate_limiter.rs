use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::debug;

use crate::cancel::{CancelToken, Cancelled};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimiterError {
    #[error("rate limiter capacity must be at least 1")]
    ZeroCapacity,
    #[error("rate limiter refill interval must be non-zero")]
    ZeroInterval,
}

/// Token bucket shared by every request one client sends to its upstream.
///
/// The bucket starts full; a background task adds one token every
/// `refill_interval / capacity` and wakes one waiter per token, so waiting
/// callers sleep instead of polling.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
    refill_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

struct Inner {
    capacity: u32,
    available: Mutex<u32>,
    refilled: Notify,
}

impl RateLimiter {
    /// Must be called inside a tokio runtime: the refill task is spawned here.
    pub fn new(capacity: u32, refill_interval: Duration) -> Result<Self, RateLimiterError> {
        if capacity == 0 {
            return Err(RateLimiterError::ZeroCapacity);
        }
        if refill_interval.is_zero() {
            return Err(RateLimiterError::ZeroInterval);
        }
        let inner = Arc::new(Inner {
            capacity,
            available: Mutex::new(capacity),
            refilled: Notify::new(),
        });
        let period = (refill_interval / capacity).max(Duration::from_millis(1));
        let handle = tokio::spawn(refill_loop(Arc::downgrade(&inner), period));
        Ok(Self {
            inner,
            refill_task: Arc::new(std::sync::Mutex::new(Some(handle))),
        })
    }

    /// `per_minute` requests per minute, the way upstream providers document their ceilings.
    pub fn per_minute(per_minute: u32) -> Result<Self, RateLimiterError> {
        Self::new(per_minute, Duration::from_secs(60))
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    pub async fn available(&self) -> u32 {
        *self.inner.available.lock().await
    }

    /// Takes one token, waiting for a refill if the bucket is empty.
    pub async fn acquire(&self, ctx: &CancelToken) -> Result<(), Cancelled> {
        ctx.check()?;
        loop {
            let notified = self.inner.refilled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire().await {
                return Ok(());
            }

            debug!(capacity = self.inner.capacity, "rate limit reached, waiting for refill");
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    pub async fn try_acquire(&self) -> bool {
        let mut available = self.inner.available.lock().await;
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    /// Halts the refill task. Waiters are not woken by it any more but still
    /// return once their context is cancelled.
    pub fn stop(&self) {
        let handle = match self.refill_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self.refill_task.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

async fn refill_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately; the bucket already starts full
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut available = inner.available.lock().await;
        if *available < inner.capacity {
            *available += 1;
            drop(available);
            inner.refilled.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;

    #[tokio::test]
    async fn rejects_zero_capacity() {
        assert_eq!(
            RateLimiter::new(0, Duration::from_secs(60)).unwrap_err(),
            RateLimiterError::ZeroCapacity
        );
        assert_eq!(
            RateLimiter::new(5, Duration::ZERO).unwrap_err(),
            RateLimiterError::ZeroInterval
        );
    }

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_never_exceeds_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_secs(3)).unwrap();
        assert_eq!(limiter.available().await, 3);
        // stay clear of tick instants so the refill task never races the drain
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert_eq!(limiter.available().await, 3);

        for _ in 0..3 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
        assert_eq!(limiter.available().await, 0);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(limiter.available().await, 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(limiter.available().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(2, Duration::from_secs(2)).unwrap();
        let source = CancelSource::new();
        let ctx = source.token();
        limiter.acquire(&ctx).await.unwrap();
        limiter.acquire(&ctx).await.unwrap();

        let started = tokio::time::Instant::now();
        limiter.acquire(&ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_returns_immediately() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60)).unwrap();
        let source = CancelSource::new();
        source.cancel();
        let started = tokio::time::Instant::now();
        assert_eq!(limiter.acquire(&source.token()).await, Err(Cancelled));
        assert_eq!(started.elapsed(), Duration::ZERO);
        // a cancelled context does not consume a token
        assert_eq!(limiter.available().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_limiter_still_honours_cancellation() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1)).unwrap();
        let source = CancelSource::new();
        limiter.acquire(&source.token()).await.unwrap();
        limiter.stop();
        assert!(limiter.is_stopped());

        let ctx = source.token().with_timeout(Duration::from_secs(5));
        assert_eq!(limiter.acquire(&ctx).await, Err(Cancelled));
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_overdraw() {
        let limiter = RateLimiter::new(4, Duration::from_secs(4)).unwrap();
        let source = CancelSource::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let ctx = source.token();
            handles.push(tokio::spawn(async move { limiter.acquire(&ctx).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let available = limiter.available().await;
        assert!(available <= limiter.capacity());
    }
}
