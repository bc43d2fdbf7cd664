use crate::error::AdmissionTimeout;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

/// The task-suspending rate limiter.
///
/// Same admission contract as [`RateLimit`](crate::RateLimit) — `size`
/// concurrency slots, optional sliding window over admission starts — but
/// waiting suspends the task instead of blocking the thread. Guards own
/// their permit, so they can be held across `.await` points and moved into
/// spawned tasks.
///
/// # Examples
///
/// ```
/// use memorate::AsyncRateLimit;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limit = AsyncRateLimit::new(2);
/// let answer = limit.call(|| async { 40 + 2 }).await;
/// assert_eq!(answer, 42);
/// assert_eq!(limit.in_flight(), 0);
/// # }
/// ```
#[derive(Debug)]
pub struct AsyncRateLimit {
    size: usize,
    duration: Option<Duration>,
    slots: Arc<Semaphore>,
    window: Mutex<VecDeque<Instant>>,
}

impl AsyncRateLimit {
    /// A limiter bounding only concurrency: at most `size` simultaneous
    /// holders.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "rate limit size must be positive");
        Self {
            size,
            duration: None,
            slots: Arc::new(Semaphore::new(size)),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// A limiter bounding concurrency and admission starts per sliding
    /// `duration` window.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `duration` is zero.
    pub fn windowed(size: usize, duration: Duration) -> Self {
        assert!(!duration.is_zero(), "rate limit window must be non-zero");
        let mut limit = Self::new(size);
        limit.duration = Some(duration);
        limit
    }

    /// The configured slot count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of admission slots currently held.
    pub fn in_flight(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Suspends until admitted, then returns the slot guard.
    pub async fn acquire(&self) -> AsyncRateGuard {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("slot semaphore is never closed");
        let guard = AsyncRateGuard { _permit: permit };
        self.wait_for_window().await;
        guard
    }

    /// Suspends until admitted or `timeout` elapses.
    ///
    /// Timing out has no side effects: the pending acquisition is dropped,
    /// any slot taken while waiting on the window is released, and no window
    /// timestamp is recorded.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<AsyncRateGuard, AdmissionTimeout> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| AdmissionTimeout { timeout })
    }

    /// Runs `f` under an admission slot.
    pub async fn call<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    /// Runs a fallible `f` under an admission slot. The limiter itself never
    /// fails here; the result is `f`'s own.
    pub async fn try_call<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    /// Waits until the sliding window has room, then stamps this admission.
    /// Cancellation-safe: the stamp is only recorded once room exists.
    async fn wait_for_window(&self) {
        let Some(duration) = self.duration else {
            return;
        };
        loop {
            let now = Instant::now();
            let ready_at = {
                let mut window = self.window.lock();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= duration)
                {
                    window.pop_front();
                }
                if window.len() < self.size {
                    window.push_back(now);
                    return;
                }
                window[0] + duration
            };
            trace!(?ready_at, "window full, sleeping until oldest start ages out");
            tokio::time::sleep_until(ready_at).await;
        }
    }
}

/// Holds one admission slot of an [`AsyncRateLimit`]; dropping it releases
/// the slot. The guard owns its permit and may outlive the borrow used to
/// acquire it.
#[derive(Debug)]
pub struct AsyncRateGuard {
    _permit: OwnedSemaphorePermit,
}
