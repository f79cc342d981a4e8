//! # Clock and sequence helpers
//!
//! A nanosecond wall clock for wire timestamps and a plain wrapping sequence
//! generator. Sequence numbers wrap at `u64::MAX` rather than saturating —
//! the wire format's 64-bit sequence field has room to spare at any
//! realistic packet rate, so wraparound is far simpler to reason about than
//! a clamp.

use quanta::Instant;

/// Nanosecond-resolution wall clock, monotonic relative to process start.
pub struct TimestampClock {
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        TimestampClock {
            epoch: Instant::now(),
        }
    }

    /// Current timestamp in nanoseconds since this clock was created.
    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic sequence number generator. Wraps in place at `u64::MAX` —
/// wraparound is accepted, not treated as an error.
pub struct SequenceGenerator {
    next: u64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator { next: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn current(&self) -> u64 {
        self.next
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_generator_increments() {
        let mut gen = SequenceGenerator::new();
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.current(), 3);
    }

    #[test]
    fn sequence_generator_wraps_at_max() {
        let mut gen = SequenceGenerator { next: u64::MAX };
        assert_eq!(gen.next(), u64::MAX);
        assert_eq!(gen.next(), 0);
    }

    #[test]
    fn timestamp_clock_monotonic() {
        let clock = TimestampClock::new();
        let t1 = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = clock.now_ns();
        assert!(t2 >= t1);
    }
}
