use crate::cache_entry::CacheEntry;
use crate::eviction::EvictionIndex;
use crate::lifetime::{IdentityHandle, LifetimeTracker};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// The key→entry map plus its ordering indexes and lifetime links.
///
/// One store belongs to exactly one engine and is mutated only behind the
/// engine's lock, so the store itself carries no synchronization. Lookup
/// applies the three absence conditions in order: missing, expired (lazy TTL
/// check), identity-purged (any linked allocation dropped). Insertion does
/// the opportunistic housekeeping: purge identity-dead keys, expire at most
/// one overdue entry, then enforce the size bound by evicting from the LRU
/// end.
#[derive(Debug)]
pub(crate) struct CacheStore<V> {
    map: HashMap<String, CacheEntry<V>>,
    index: EvictionIndex,
    lifetimes: LifetimeTracker,
    limit: Option<NonZeroUsize>,
    ttl: Option<Duration>,
}

impl<V: Clone> CacheStore<V> {
    pub(crate) fn new(limit: Option<NonZeroUsize>, ttl: Option<Duration>) -> Self {
        Self {
            map: HashMap::new(),
            index: EvictionIndex::new(),
            lifetimes: LifetimeTracker::default(),
            limit,
            ttl,
        }
    }

    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the live value for `key`, refreshing its recency. Expired and
    /// identity-dead entries are removed and reported as misses.
    pub(crate) fn get(&mut self, key: &str) -> Option<V> {
        let entry = self.map.get(key)?;
        if entry.is_expired() || !self.lifetimes.is_live(key) {
            self.evict(key);
            return None;
        }
        let value = entry.value.clone();
        self.index.touch(key);
        Some(value)
    }

    /// Inserts a freshly computed value, binding `handles` as its identity
    /// links. Returns every key evicted while making room, so the caller can
    /// mirror the removals to persistence.
    pub(crate) fn insert(
        &mut self,
        key: String,
        value: V,
        handles: Vec<IdentityHandle>,
    ) -> Vec<String> {
        let entry = CacheEntry::new(value, self.ttl);
        self.insert_entry(key, entry, handles)
    }

    /// Inserts an entry reloaded from persistence, keeping its original
    /// timestamps. Reloaded entries never carry identity links.
    pub(crate) fn insert_loaded(&mut self, key: String, entry: CacheEntry<V>) -> Vec<String> {
        self.insert_entry(key, entry, Vec::new())
    }

    fn insert_entry(
        &mut self,
        key: String,
        entry: CacheEntry<V>,
        handles: Vec<IdentityHandle>,
    ) -> Vec<String> {
        let mut evicted = self.purge_dead();
        if let Some(expired) = self.expire_one() {
            evicted.push(expired);
        }

        if self.map.insert(key.clone(), entry).is_some() {
            // Re-insert under the same key: restart its order positions.
            self.index.remove(&key);
        }
        self.index.record_insert(&key, self.ttl.is_some());
        self.lifetimes.unbind(&key);
        self.lifetimes.bind(&key, handles);

        if let Some(limit) = self.limit {
            while self.map.len() > limit.get() {
                let Some(lru) = self.index.lru_candidate().map(str::to_string) else {
                    break;
                };
                debug!(key = %lru, "evicting least recently used entry");
                self.evict(&lru);
                evicted.push(lru);
            }
        }
        evicted
    }

    /// Replaces the value of an existing live entry in place, keeping its
    /// timestamps and identity links. Returns false when absent.
    pub(crate) fn update(&mut self, key: &str, value: V) -> bool {
        match self.map.get_mut(key) {
            Some(entry) if !entry.is_expired_at(Instant::now()) => {
                entry.value = value;
                self.index.touch(key);
                true
            }
            _ => false,
        }
    }

    /// Removes one entry. Returns whether it existed.
    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.evict(key)
    }

    pub(crate) fn reset(&mut self) {
        self.map.clear();
        self.index.clear();
        self.lifetimes.clear();
    }

    /// Whether `key` currently has identity links. Identity-linked entries
    /// stay out of the persistence mirror.
    pub(crate) fn is_identity_linked(&self, key: &str) -> bool {
        self.lifetimes.is_linked(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every key with a dead identity link. Called opportunistically
    /// on insertion; lookups catch dead entries individually.
    fn purge_dead(&mut self) -> Vec<String> {
        let dead = self.lifetimes.dead_keys();
        for key in &dead {
            debug!(key = %key, "purging identity-dead entry");
            self.evict(key);
        }
        dead
    }

    /// Expires at most one overdue entry from the front of the expiry
    /// queue. One check per insertion keeps housekeeping O(1) without a
    /// background sweep.
    fn expire_one(&mut self) -> Option<String> {
        let key = self.index.expiry_candidate()?.to_string();
        let overdue = self.map.get(&key).is_some_and(|e| e.is_expired());
        if overdue {
            debug!(key = %key, "expiring overdue entry");
            self.evict(&key);
            Some(key)
        } else {
            None
        }
    }

    fn evict(&mut self, key: &str) -> bool {
        let existed = self.map.remove(key).is_some();
        self.index.remove(key);
        self.lifetimes.unbind(key);
        existed
    }
}
