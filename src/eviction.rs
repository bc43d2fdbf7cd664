use std::collections::VecDeque;

/// Ordering indexes over the key space, kept separate from the value map.
///
/// Two queues: `recency` orders keys least- to most-recently used and drives
/// the size bound; `expiry` holds keys in insertion order, which is also
/// expiry order because every entry of one engine shares the same duration
/// bound. Ties on the size bound break by insertion order, which the recency
/// queue preserves for never-touched keys.
#[derive(Debug, Default)]
pub(crate) struct EvictionIndex {
    recency: VecDeque<String>,
    expiry: VecDeque<String>,
}

impl EvictionIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a newly inserted key as most recently used and last to
    /// expire. `track_expiry` is false for engines without a duration bound.
    pub(crate) fn record_insert(&mut self, key: &str, track_expiry: bool) {
        self.recency.push_back(key.to_string());
        if track_expiry {
            self.expiry.push_back(key.to_string());
        }
    }

    /// Marks `key` as most recently used. Unknown keys are ignored.
    pub(crate) fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            let k = self.recency.remove(pos).unwrap_or_else(|| key.to_string());
            self.recency.push_back(k);
        }
    }

    /// Removes `key` from both queues.
    pub(crate) fn remove(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        if let Some(pos) = self.expiry.iter().position(|k| k == key) {
            self.expiry.remove(pos);
        }
    }

    /// The least recently used key, if any.
    pub(crate) fn lru_candidate(&self) -> Option<&str> {
        self.recency.front().map(String::as_str)
    }

    /// The key due to expire soonest, if any.
    pub(crate) fn expiry_candidate(&self) -> Option<&str> {
        self.expiry.front().map(String::as_str)
    }

    pub(crate) fn clear(&mut self) {
        self.recency.clear();
        self.expiry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_order_is_lru_order_without_touches() {
        let mut index = EvictionIndex::new();
        index.record_insert("a", false);
        index.record_insert("b", false);
        index.record_insert("c", false);
        assert_eq!(index.lru_candidate(), Some("a"));
    }

    #[test]
    fn touch_moves_key_to_most_recent() {
        let mut index = EvictionIndex::new();
        index.record_insert("a", false);
        index.record_insert("b", false);
        index.touch("a");
        assert_eq!(index.lru_candidate(), Some("b"));
    }

    #[test]
    fn touch_of_unknown_key_is_ignored() {
        let mut index = EvictionIndex::new();
        index.record_insert("a", false);
        index.touch("zzz");
        assert_eq!(index.lru_candidate(), Some("a"));
    }

    #[test]
    fn expiry_queue_tracks_insertion_order() {
        let mut index = EvictionIndex::new();
        index.record_insert("a", true);
        index.record_insert("b", true);
        // Recency reordering must not disturb expiry order.
        index.touch("a");
        assert_eq!(index.expiry_candidate(), Some("a"));
    }

    #[test]
    fn remove_clears_both_queues() {
        let mut index = EvictionIndex::new();
        index.record_insert("a", true);
        index.record_insert("b", true);
        index.remove("a");
        assert_eq!(index.lru_candidate(), Some("b"));
        assert_eq!(index.expiry_candidate(), Some("b"));
    }
}
