//! # Reorder buffer
//!
//! Sequence-indexed holding buffer with a strict capacity bound, backed by a
//! `BTreeMap` for ordered iteration over buffered sequence numbers. On
//! overflow the numerically oldest entry is force-evicted (ties broken by
//! lowest sequence id) to make room for the new arrival. A periodic
//! [`ReorderBuffer::cleanup_expired`] sweep drops entries that have aged past
//! `reorder_timeout` and advances `next_expected` past the stalled gap.

use bytes::Bytes;
use quanta::Instant;
use std::collections::BTreeMap;
use std::time::Duration;

struct Entry {
    payload: Bytes,
    inserted_at: Instant,
}

/// Bounded, timeout-aware reorder buffer keyed by sequence id.
pub struct ReorderBuffer {
    capacity: usize,
    reorder_timeout: Duration,
    next_expected: u64,
    buf: BTreeMap<u64, Entry>,
    last_sweep: Option<Instant>,
}

/// In-order payloads released by an insert or sweep, plus the release cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Released because it filled a contiguous run starting at `next_expected`.
    InOrder,
    /// Released because the buffer was full and this was the oldest entry.
    ForcedEviction,
    /// Released because the entry aged past `reorder_timeout`.
    Expired,
}

impl ReorderBuffer {
    pub fn new(capacity: usize, next_expected: u64, reorder_timeout: Duration) -> Self {
        assert!(capacity > 0, "reorder buffer capacity must be > 0");
        ReorderBuffer {
            capacity,
            reorder_timeout,
            next_expected,
            buf: BTreeMap::new(),
            last_sweep: None,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Insert a received payload. Returns the in-order run of payloads this
    /// insert makes deliverable (possibly empty), in ascending sequence order.
    ///
    /// If inserting would exceed capacity, the numerically oldest buffered
    /// entry is evicted first (its payload is returned alongside the cause so
    /// callers can count it as loss).
    pub fn insert(
        &mut self,
        sequence_id: u64,
        payload: Bytes,
        now: Instant,
    ) -> (Vec<Bytes>, Option<(u64, Bytes)>) {
        if sequence_id < self.next_expected {
            // Already delivered or expired past this point — duplicate/late.
            return (Vec::new(), None);
        }

        if sequence_id == self.next_expected {
            let mut released = vec![payload];
            self.next_expected = self.next_expected.wrapping_add(1);
            released.extend(self.drain_contiguous());
            return (released, None);
        }

        let mut evicted = None;
        if !self.buf.contains_key(&sequence_id) && self.buf.len() >= self.capacity {
            if let Some((&oldest_seq, _)) = self.buf.iter().next() {
                if let Some(entry) = self.buf.remove(&oldest_seq) {
                    evicted = Some((oldest_seq, entry.payload));
                    // The gap left by the eviction can never be filled, so
                    // next_expected advances past it (and any other entries
                    // that are now the new contiguous floor).
                    if oldest_seq == self.next_expected {
                        self.next_expected = self.next_expected.wrapping_add(1);
                    }
                }
            }
        }

        self.buf.insert(
            sequence_id,
            Entry {
                payload,
                inserted_at: now,
            },
        );

        // After an eviction the floor may have moved into a run we already
        // hold buffered; drain it.
        let mut released = Vec::new();
        if let Some((seq, _)) = &evicted {
            if *seq + 1 == self.next_expected || self.buf.contains_key(&self.next_expected) {
                released.extend(self.drain_contiguous());
            }
        }
        (released, evicted)
    }

    fn drain_contiguous(&mut self) -> Vec<Bytes> {
        let mut released = Vec::new();
        while let Some(entry) = self.buf.remove(&self.next_expected) {
            released.push(entry.payload);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        released
    }

    /// Idempotent timeout sweep. Runs at most once per `reorder_timeout`; a
    /// call before that window elapses is a no-op. Entries older than
    /// `now - reorder_timeout` are dropped and `next_expected` advances past
    /// the lowest contiguous missing prefix they leave behind.
    pub fn cleanup_expired(&mut self, now: Instant) -> Vec<u64> {
        if let Some(last) = self.last_sweep {
            if now.duration_since(last) < self.reorder_timeout {
                return Vec::new();
            }
        }
        self.last_sweep = Some(now);

        let cutoff = now - self.reorder_timeout;
        let expired: Vec<u64> = self
            .buf
            .iter()
            .filter(|(_, e)| e.inserted_at < cutoff)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in &expired {
            self.buf.remove(seq);
        }

        // Advance next_expected past the lowest contiguous missing prefix:
        // skip forward while the slot is neither buffered nor ever coming.
        while !self.buf.contains_key(&self.next_expected) {
            match self.buf.keys().next() {
                Some(&lowest) if lowest > self.next_expected => {
                    self.next_expected = lowest;
                }
                Some(&lowest) if lowest == self.next_expected => break,
                _ => break,
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    /// Scenario 3: capacity 4, feed [2,1,4,3] with next_expected=1 — after
    /// sequence 3 arrives, 1,2,3,4 are released in order and the buffer is
    /// empty.
    #[test]
    fn scenario_3_in_order_release_on_gap_fill() {
        let mut rb = ReorderBuffer::new(4, 1, Duration::from_millis(500));
        let n = now();

        let (released, evicted) = rb.insert(2, Bytes::from_static(b"2"), n);
        assert!(released.is_empty());
        assert!(evicted.is_none());

        let (released, _) = rb.insert(1, Bytes::from_static(b"1"), n);
        assert_eq!(released, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);

        let (released, _) = rb.insert(4, Bytes::from_static(b"4"), n);
        assert!(released.is_empty());

        let (released, _) = rb.insert(3, Bytes::from_static(b"3"), n);
        assert_eq!(
            released,
            vec![Bytes::from_static(b"3"), Bytes::from_static(b"4")]
        );
        assert!(rb.is_empty());
        assert_eq!(rb.next_expected(), 5);
    }

    /// Scenario 4: capacity 4, next_expected=1, feed [2,3,4,5] (no 1) — buffer
    /// is full; inserting 6 force-releases payload 2, sets next_expected=3,
    /// and stores 6.
    #[test]
    fn scenario_4_force_eviction_on_overflow() {
        let mut rb = ReorderBuffer::new(4, 1, Duration::from_millis(500));
        let n = now();
        for seq in [2u64, 3, 4, 5] {
            let (released, evicted) =
                rb.insert(seq, Bytes::from(seq.to_string()), n);
            assert!(released.is_empty());
            assert!(evicted.is_none());
        }
        assert_eq!(rb.len(), 4);

        let (released, evicted) = rb.insert(6, Bytes::from_static(b"6"), n);
        assert!(released.is_empty());
        let (seq, payload) = evicted.expect("oldest entry should be evicted");
        assert_eq!(seq, 2);
        assert_eq!(&payload[..], b"2");
        assert_eq!(rb.next_expected(), 3);
        assert!(rb.len() <= 4);
    }

    #[test]
    fn cleanup_runs_at_most_once_per_timeout() {
        let mut rb = ReorderBuffer::new(4, 1, Duration::from_millis(50));
        let t0 = now();
        rb.insert(5, Bytes::from_static(b"x"), t0);
        let first = rb.cleanup_expired(t0);
        assert!(first.is_empty());
        // Immediately calling again within the window is a no-op, even if
        // time has technically passed a hair.
        let second = rb.cleanup_expired(t0);
        assert!(second.is_empty());
    }

    #[test]
    fn duplicate_or_late_sequence_is_ignored() {
        let mut rb = ReorderBuffer::new(4, 10, Duration::from_millis(500));
        let n = now();
        let (released, evicted) = rb.insert(3, Bytes::from_static(b"late"), n);
        assert!(released.is_empty());
        assert!(evicted.is_none());
        assert_eq!(rb.next_expected(), 10);
    }
}
