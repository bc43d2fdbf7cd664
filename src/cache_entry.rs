use std::time::{Duration, Instant};

/// A committed cache value with its creation and expiry timestamps.
///
/// Entries are owned exclusively by the store. `expires_at` is fixed at
/// insertion from the engine's configured duration bound; expiry is checked
/// lazily on lookup and opportunistically on insertion, so an expired entry
/// may briefly remain in memory but is never returned.
///
/// # Examples
///
/// ```
/// use memorate::CacheEntry;
/// use std::time::Duration;
///
/// let entry = CacheEntry::new(42, Some(Duration::from_secs(60)));
/// assert!(!entry.is_expired());
///
/// let eternal = CacheEntry::new(42, None);
/// assert!(!eternal.is_expired());
/// ```
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    /// Creates an entry timestamped now, expiring after `ttl` if given.
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
        }
    }

    /// Rebuilds an entry with explicit timestamps. Used when reloading
    /// persisted entries, whose remaining lifetime started in a previous
    /// process.
    pub fn with_timestamps(value: V, created_at: Instant, expires_at: Option<Instant>) -> Self {
        Self {
            value,
            created_at,
            expires_at,
        }
    }

    /// Whether the entry is past its expiry instant.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Expiry check against a caller-supplied clock reading, so one reading
    /// can serve a whole housekeeping pass.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_not_expired() {
        let entry = CacheEntry::new("v", Some(Duration::from_secs(30)));
        assert!(!entry.is_expired());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let entry = CacheEntry::new("v", Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(entry.is_expired());
    }

    #[test]
    fn no_ttl_never_expires() {
        let entry = CacheEntry::new("v", None);
        assert!(!entry.is_expired_at(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn boundary_is_checked_against_supplied_clock() {
        let entry = CacheEntry::new("v", Some(Duration::from_secs(10)));
        let expires_at = entry.expires_at.unwrap();
        assert!(!entry.is_expired_at(expires_at - Duration::from_millis(1)));
        assert!(entry.is_expired_at(expires_at));
    }
}
