use crate::error::AdmissionTimeout;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

/// The thread-blocking rate limiter.
///
/// Admission is gated on two coupled budgets:
///
/// - **Concurrency**: at most `size` callers hold an admission slot at once.
///   Slots are released when the [`RateGuard`] drops.
/// - **Window** (only with a `duration`): at most `size` admissions may
///   *start* within any sliding `duration`. The window counts starts, not
///   completions, so a burst of quick calls is still spread out.
///
/// Guards nest, so stacking limiters gates admission jointly: acquire from
/// an outer coarse limiter, then an inner fine one.
///
/// # Examples
///
/// ```
/// use memorate::RateLimit;
/// use std::time::Duration;
///
/// // At most 2 concurrent calls, at most 2 started per 100ms.
/// let limit = RateLimit::windowed(2, Duration::from_millis(100));
/// let answer = limit.call(|| 40 + 2);
/// assert_eq!(answer, 42);
/// assert_eq!(limit.in_flight(), 0);
/// ```
#[derive(Debug)]
pub struct RateLimit {
    size: usize,
    duration: Option<Duration>,
    available: Mutex<usize>,
    released: Condvar,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimit {
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
            available: Mutex::new(size),
            released: Condvar::new(),
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
        self.size - *self.available.lock()
    }

    /// Blocks until admitted, then returns the slot guard.
    pub fn acquire(&self) -> RateGuard<'_> {
        let mut available = self.available.lock();
        self.released.wait_while(&mut available, |n| *n == 0);
        *available -= 1;
        drop(available);
        let guard = RateGuard { limit: self };
        // Infallible without a deadline.
        let _ = self.wait_for_window(None);
        guard
    }

    /// Blocks until admitted or `timeout` elapses.
    ///
    /// Timing out has no side effects: the slot (if one was taken while
    /// waiting on the window) is released and no window timestamp is
    /// recorded.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<RateGuard<'_>, AdmissionTimeout> {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();
        while *available == 0 {
            if self
                .released
                .wait_until(&mut available, deadline)
                .timed_out()
                && *available == 0
            {
                return Err(AdmissionTimeout { timeout });
            }
        }
        *available -= 1;
        drop(available);
        let guard = RateGuard { limit: self };
        match self.wait_for_window(Some((deadline, timeout))) {
            Ok(()) => Ok(guard),
            // Guard drops here, releasing the slot.
            Err(err) => Err(err),
        }
    }

    /// Runs `f` under an admission slot.
    pub fn call<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.acquire();
        f()
    }

    /// Runs a fallible `f` under an admission slot. The limiter itself never
    /// fails here; the result is `f`'s own.
    pub fn try_call<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        let _guard = self.acquire();
        f()
    }

    /// Waits until the sliding window has room, then stamps this admission.
    /// With a deadline, gives up before sleeping past it.
    fn wait_for_window(
        &self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), AdmissionTimeout> {
        let Some(duration) = self.duration else {
            return Ok(());
        };
        loop {
            let now = Instant::now();
            let mut window = self.window.lock();
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= duration)
            {
                window.pop_front();
            }
            if window.len() < self.size {
                window.push_back(now);
                return Ok(());
            }
            let oldest = window[0];
            drop(window);

            let ready_at = oldest + duration;
            if let Some((deadline, timeout)) = deadline {
                if ready_at > deadline {
                    return Err(AdmissionTimeout { timeout });
                }
            }
            trace!(?ready_at, "window full, sleeping until oldest start ages out");
            std::thread::sleep(ready_at.saturating_duration_since(Instant::now()));
        }
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        drop(available);
        self.released.notify_one();
    }
}

/// Holds one admission slot of a [`RateLimit`]; dropping it releases the
/// slot. The window timestamp, once recorded, stays — the window limits
/// starts, and a start happened.
#[derive(Debug)]
pub struct RateGuard<'a> {
    limit: &'a RateLimit,
}

impl Drop for RateGuard<'_> {
    fn drop(&mut self) {
        self.limit.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    #[should_panic(expected = "size must be positive")]
    fn zero_size_is_rejected() {
        let _ = RateLimit::new(0);
    }

    #[test]
    fn guard_releases_slot_on_drop() {
        let limit = RateLimit::new(1);
        assert_eq!(limit.in_flight(), 0);
        {
            let _guard = limit.acquire();
            assert_eq!(limit.in_flight(), 1);
        }
        assert_eq!(limit.in_flight(), 0);
        // The slot freed up, so the next acquire does not block.
        let _guard = limit.acquire();
    }

    #[test]
    fn concurrency_never_exceeds_size() {
        let limit = Arc::new(RateLimit::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limit = Arc::clone(&limit);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    limit.call(|| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn window_delays_admissions_past_the_quota() {
        let limit = RateLimit::windowed(2, Duration::from_millis(50));
        let start = Instant::now();
        for _ in 0..3 {
            drop(limit.acquire());
        }
        // The third start had to wait for the first stamp to age out.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn acquire_timeout_fails_without_side_effects() {
        let limit = Arc::new(RateLimit::new(1));
        let holder = limit.acquire();
        let result = limit.acquire_timeout(Duration::from_millis(10));
        assert_eq!(result.err(), Some(AdmissionTimeout {
            timeout: Duration::from_millis(10),
        }));
        assert_eq!(limit.in_flight(), 1);
        drop(holder);
        assert_eq!(limit.in_flight(), 0);
        assert!(limit.acquire_timeout(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn window_timeout_releases_the_slot() {
        let limit = RateLimit::windowed(1, Duration::from_millis(200));
        drop(limit.acquire());
        // Slot is free but the window is full for ~200ms.
        let result = limit.acquire_timeout(Duration::from_millis(10));
        assert!(result.is_err());
        assert_eq!(limit.in_flight(), 0);
    }

    #[test]
    fn stacked_limiters_gate_jointly() {
        let outer = RateLimit::new(2);
        let inner = RateLimit::new(1);
        let _outer_guard = outer.acquire();
        let _inner_guard = inner.acquire();
        assert_eq!(outer.in_flight(), 1);
        assert_eq!(inner.in_flight(), 1);
    }
}
