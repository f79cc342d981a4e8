//! # Dedup cache
//!
//! Standalone duplicate-sequence detector with TTL-based eviction, decoupled
//! from the reorder buffer so either can be tuned or swapped independently.
//!
//! TTL should be configured to at least twice the worst-case inter-arrival
//! delay across bonded uplinks, so a duplicate arriving on a slower path
//! after the faster path's copy has already aged out is still caught.

use quanta::Instant;
use std::collections::HashMap;
use std::time::Duration;

pub struct DedupCache {
    ttl: Duration,
    max_size: usize,
    seen: HashMap<u64, Instant>,
}

impl DedupCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        DedupCache {
            ttl,
            max_size,
            seen: HashMap::new(),
        }
    }

    /// Returns `true` if `sequence_id` was already seen within the TTL
    /// window (a duplicate), `false` the first time. Every call evicts
    /// entries older than `ttl` first, then enforces `max_size` by evicting
    /// the oldest remaining entries.
    pub fn is_duplicate(&mut self, sequence_id: u64, now: Instant) -> bool {
        self.evict_expired(now);

        if self.seen.contains_key(&sequence_id) {
            return true;
        }

        if self.seen.len() >= self.max_size {
            self.evict_oldest(1);
        }
        self.seen.insert(sequence_id, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        let cutoff = now - self.ttl;
        self.seen.retain(|_, &mut seen_at| seen_at >= cutoff);
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(u64, Instant)> =
            self.seen.iter().map(|(&seq, &at)| (seq, at)).collect();
        by_age.sort_by_key(|&(_, at)| at);
        for (seq, _) in by_age.into_iter().take(count) {
            self.seen.remove(&seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_is_not_duplicate() {
        let mut cache = DedupCache::new(16, Duration::from_secs(1));
        let now = Instant::now();
        assert!(!cache.is_duplicate(1, now));
    }

    #[test]
    fn repeat_within_ttl_is_duplicate() {
        let mut cache = DedupCache::new(16, Duration::from_secs(1));
        let now = Instant::now();
        assert!(!cache.is_duplicate(1, now));
        assert!(cache.is_duplicate(1, now));
    }

    #[test]
    fn returns_false_exactly_once_per_id_within_window() {
        let mut cache = DedupCache::new(16, Duration::from_secs(10));
        let now = Instant::now();
        let mut first_seen = 0;
        for _ in 0..5 {
            if !cache.is_duplicate(42, now) {
                first_seen += 1;
            }
        }
        assert_eq!(first_seen, 1);
    }

    #[test]
    fn expired_entry_is_no_longer_a_duplicate() {
        let mut cache = DedupCache::new(16, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(!cache.is_duplicate(1, t0));
        std::thread::sleep(Duration::from_millis(20));
        let t1 = Instant::now();
        assert!(!cache.is_duplicate(1, t1), "entry should have expired");
    }

    #[test]
    fn max_size_evicts_oldest_first() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(!cache.is_duplicate(1, t0));
        let t1 = t0 + Duration::from_millis(1);
        assert!(!cache.is_duplicate(2, t1));
        let t2 = t0 + Duration::from_millis(2);
        assert!(!cache.is_duplicate(3, t2));
        assert!(cache.len() <= 2);
        // The oldest id (1) should have been evicted to make room.
        let t3 = t0 + Duration::from_millis(3);
        assert!(!cache.is_duplicate(1, t3));
    }
}
