//! # Transport statistics
//!
//! Per-WAN and aggregate counters for the bonding dataplane. All stats are
//! designed for Prometheus export and JSON serialization.
//!
//! There are deliberately no retransmission- or congestion-window-specific
//! fields (`packets_acked`, `retransmissions`, `cwnd`, `pacing_rate_bps`):
//! this dataplane never retransmits or paces, it routes across redundant
//! links instead. `Ewma` and `RateCounter` are generic rate-smoothing
//! utilities with no ARQ dependency.

use quanta::Instant;
use serde::Serialize;

// ─── Sender stats ────────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Total packets sent across all WAN links.
    pub packets_sent: u64,
    /// Total payload bytes sent (excludes header/FEC overhead).
    pub bytes_sent: u64,
    /// FEC parity shards emitted.
    pub fec_parity_sent: u64,
    /// FEC groups flushed (complete or forced by deadline).
    pub fec_groups_emitted: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// FEC overhead ratio: parity shards sent per data packet sent.
    pub fn fec_overhead_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.fec_parity_sent as f64 / self.packets_sent as f64
        }
    }
}

// ─── Receiver stats ──────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Total packets received (including duplicates and late arrivals).
    pub packets_received: u64,
    /// Total payload bytes received.
    pub bytes_received: u64,
    /// Packets delivered to the application (unique, in-order).
    pub packets_delivered: u64,
    /// Duplicate packets dropped by the dedup cache.
    pub duplicates: u64,
    /// Packets dropped by the reorder buffer (forced eviction or expiry).
    pub reorder_drops: u64,
    /// Packets recovered via FEC.
    pub fec_recoveries: u64,
    /// Highest contiguous sequence id delivered.
    pub highest_delivered_seq: u64,
    /// Current reorder buffer occupancy.
    pub reorder_buffer_depth: u32,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective goodput: unique packets delivered vs. total received.
    pub fn goodput_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.packets_delivered as f64 / self.packets_received as f64
        }
    }
}

// ─── Per-WAN stats ───────────────────────────────────────────────────────────

/// Per-WAN-link statistics snapshot, fed by the health prober and router.
#[derive(Debug, Clone, Serialize)]
pub struct WanStats {
    /// WAN link identifier.
    pub wan_id: u8,
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// RTT jitter (smoothed deviation) in milliseconds.
    pub jitter_ms: f64,
    /// Minimum RTT observed, in milliseconds.
    pub min_rtt_ms: f64,
    /// Estimated link capacity in bytes/sec.
    pub capacity_bps: f64,
    /// Observed loss rate (0.0 - 1.0).
    pub loss_rate: f64,
    /// Packets sent on this link.
    pub packets_sent: u64,
    /// Packets received on this link.
    pub packets_received: u64,
    /// Whether the router currently considers this link usable.
    pub active: bool,
    /// Health state name (`"up"`, `"degraded"`, `"down"`).
    pub health_state: String,
}

// ─── Rate counter ────────────────────────────────────────────────────────────

/// Windowed rate counter for computing bytes/sec or packets/sec.
pub struct RateCounter {
    samples: Vec<(Instant, u64)>,
    window: std::time::Duration,
}

impl RateCounter {
    pub fn new(window: std::time::Duration) -> Self {
        RateCounter {
            samples: Vec::with_capacity(128),
            window,
        }
    }

    pub fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push((now, value));
        self.cleanup();
    }

    /// Sum of values in the window, divided by window duration (per second).
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let cutoff = now - self.window;
        let sum: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum();
        sum as f64 / self.window.as_secs_f64()
    }

    pub fn count_in_window(&self) -> u64 {
        let cutoff = Instant::now() - self.window;
        self.samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sender_fec_overhead_ratio() {
        let mut stats = SenderStats::new();
        stats.packets_sent = 100;
        stats.fec_parity_sent = 25;
        assert!((stats.fec_overhead_ratio() - 0.25).abs() < 0.001);
    }

    #[test]
    fn sender_fec_overhead_zero_div() {
        let stats = SenderStats::new();
        assert_eq!(stats.fec_overhead_ratio(), 0.0);
    }

    #[test]
    fn receiver_goodput_ratio() {
        let mut stats = ReceiverStats::new();
        stats.packets_received = 110;
        stats.packets_delivered = 100;
        assert!((stats.goodput_ratio() - 100.0 / 110.0).abs() < 0.001);
    }

    #[test]
    fn receiver_goodput_zero_div() {
        let stats = ReceiverStats::new();
        assert_eq!(stats.goodput_ratio(), 0.0);
    }

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 0.001, "EWMA 0.5 should average: got {v}");
    }

    #[test]
    fn ewma_high_alpha_is_responsive() {
        let mut fast = Ewma::new(0.9);
        let mut slow = Ewma::new(0.1);
        fast.update(100.0);
        slow.update(100.0);
        fast.update(200.0);
        slow.update(200.0);
        assert!(fast.value() > slow.value());
    }

    #[test]
    fn ewma_reset() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        ewma.reset();
        assert_eq!(ewma.value(), 0.0);
        ewma.update(50.0);
        assert_eq!(ewma.value(), 50.0);
    }

    #[test]
    fn rate_counter_basic() {
        let mut counter = RateCounter::new(Duration::from_secs(1));
        counter.record(1000);
        counter.record(2000);
        assert!(counter.rate() > 0.0);
    }

    #[test]
    fn rate_counter_count_in_window() {
        let mut counter = RateCounter::new(Duration::from_secs(10));
        counter.record(100);
        counter.record(200);
        counter.record(300);
        assert_eq!(counter.count_in_window(), 600);
    }

    #[test]
    fn wan_stats_serialization() {
        let stats = WanStats {
            wan_id: 1,
            rtt_ms: 50.0,
            jitter_ms: 5.0,
            min_rtt_ms: 40.0,
            capacity_bps: 5_000_000.0,
            loss_rate: 0.02,
            packets_sent: 10_000,
            packets_received: 9_800,
            active: true,
            health_state: "up".to_string(),
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"wan_id\":1"));
        assert!(json.contains("\"health_state\":\"up\""));
    }
}
