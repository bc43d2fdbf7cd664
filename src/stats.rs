use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine counters for cache accesses and persistence skips.
///
/// Every memoize engine owns one `MemoStats` instance, accessible through
/// [`Memoize::stats`](crate::Memoize::stats) and
/// [`AsyncMemoize::stats`](crate::AsyncMemoize::stats). Counters use relaxed
/// atomics so recording is cheap and safe from any thread.
///
/// `persist_errors` is the reporting side channel for persistence failures:
/// records that could not be loaded or mirrored are skipped (with a
/// warning-level log line) rather than failing the call, and each skip bumps
/// this counter.
///
/// # Examples
///
/// ```
/// use memorate::MemoStats;
///
/// let stats = MemoStats::new();
/// stats.record_hit();
/// stats.record_miss();
/// assert_eq!(stats.hits(), 1);
/// assert_eq!(stats.misses(), 1);
/// assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Default)]
pub struct MemoStats {
    hits: AtomicU64,
    misses: AtomicU64,
    persist_errors: AtomicU64,
}

impl MemoStats {
    /// Creates a stats block with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_persist_error(&self) {
        self.persist_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_persist_errors(&self, n: u64) {
        if n > 0 {
            self.persist_errors.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of lookups that missed (absent, expired, or identity-purged).
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of persistence records skipped due to I/O or encoding failures.
    pub fn persist_errors(&self) -> u64 {
        self.persist_errors.load(Ordering::Relaxed)
    }

    /// Total recorded lookups.
    pub fn total_accesses(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Fraction of lookups answered from the cache, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}
