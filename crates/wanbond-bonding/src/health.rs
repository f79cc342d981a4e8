//! # Health prober
//!
//! Per-WAN state machine tracking probe results, with adaptive probe
//! interval and epsilon-greedy probe method selection (round-robin during
//! bootstrap, then exploit the historically most reliable method).
//!
//! Asymmetric hysteresis (`degraded_threshold` < `recovery_threshold`,
//! an event emitted on every transition) drives a six-state machine
//! (`Unknown`/`Testing`/`Up`/`Degraded`/`Down`/`Recovering`) rather than a
//! flat healthy/degraded flag, since this dataplane has no richer telemetry
//! to score beyond probe success/failure.
//!
//! A single over-threshold latency or loss sample drops an `Up` link to
//! `Degraded` immediately, bypassing the consecutive-failure counters —
//! sustained packet loss shouldn't need several probe rounds to register.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Lifecycle state of a single WAN link's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No probes have completed yet.
    Unknown,
    /// Bootstrap phase — cycling through probe methods looking for the
    /// first success.
    Testing,
    Up,
    Degraded,
    Down,
    /// Was `Down`, has seen at least one success, accumulating successes
    /// toward the recovery threshold.
    Recovering,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Testing => "testing",
            HealthState::Up => "up",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
            HealthState::Recovering => "recovering",
        }
    }
}

/// How a probe reaches the far end of a WAN link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeMethod {
    Ping,
    Tcp,
    Http,
    Dns,
    /// Let the prober pick — resolved to a concrete method before use.
    Auto,
}

const CONCRETE_METHODS: [ProbeMethod; 4] = [
    ProbeMethod::Ping,
    ProbeMethod::Tcp,
    ProbeMethod::Http,
    ProbeMethod::Dns,
];

/// Events raised on a health state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    StateChanged {
        wan_id: u8,
        from: HealthState,
        to: HealthState,
    },
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures while `Up` before dropping to `Degraded`.
    pub degraded_after: u32,
    /// Consecutive failures while `Degraded` before dropping to `Down`.
    pub down_after: u32,
    /// Consecutive successes while `Degraded`/`Recovering` before returning
    /// to `Up`. Larger than the failure thresholds so recovery requires
    /// more evidence than degradation did.
    pub recovery_after: u32,
    /// Minimum probe interval (healthy steady state).
    pub min_interval: Duration,
    /// Maximum probe interval (degraded/down — probe more eagerly).
    pub max_interval: Duration,
    /// Exploration rate for epsilon-greedy method selection.
    pub epsilon: f64,
    /// A single sample at or above this latency drops an `Up` link straight
    /// to `Degraded`, independent of the consecutive-failure counters.
    pub degraded_latency_ms: f64,
    /// A single sample at or above this loss rate drops an `Up` link
    /// straight to `Degraded`, independent of the consecutive-failure
    /// counters.
    pub degraded_loss: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            degraded_after: 2,
            down_after: 5,
            recovery_after: 3,
            min_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            epsilon: 0.1,
            degraded_latency_ms: 200.0,
            degraded_loss: 0.05,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MethodStats {
    attempts: u64,
    successes: u64,
}

impl MethodStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

struct LinkProbeState {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    method_stats: HashMap<ProbeMethod, MethodStats>,
    bootstrap_idx: usize,
}

impl LinkProbeState {
    fn new() -> Self {
        LinkProbeState {
            state: HealthState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            method_stats: HashMap::new(),
            bootstrap_idx: 0,
        }
    }
}

/// Tracks per-WAN probe state and drives the health state machine.
pub struct HealthProber {
    config: HealthConfig,
    links: HashMap<u8, LinkProbeState>,
    rng: SmallRng,
}

impl HealthProber {
    pub fn new(config: HealthConfig) -> Self {
        HealthProber {
            config,
            links: HashMap::new(),
            rng: SmallRng::seed_from_u64(0xB04D),
        }
    }

    pub fn register(&mut self, wan_id: u8) {
        self.links.entry(wan_id).or_insert_with(LinkProbeState::new);
    }

    pub fn remove(&mut self, wan_id: u8) {
        self.links.remove(&wan_id);
    }

    pub fn state(&self, wan_id: u8) -> HealthState {
        self.links
            .get(&wan_id)
            .map(|s| s.state)
            .unwrap_or(HealthState::Unknown)
    }

    /// Choose the next concrete probe method for a link: round-robin until
    /// every method has been tried at least once, then epsilon-greedy over
    /// observed success rates.
    pub fn select_method(&mut self, wan_id: u8) -> ProbeMethod {
        let link = self.links.entry(wan_id).or_insert_with(LinkProbeState::new);

        if link.bootstrap_idx < CONCRETE_METHODS.len() {
            let method = CONCRETE_METHODS[link.bootstrap_idx];
            link.bootstrap_idx += 1;
            return method;
        }

        if self.rng.gen_range(0.0..1.0) < self.config.epsilon {
            let idx = self.rng.gen_range(0..CONCRETE_METHODS.len());
            return CONCRETE_METHODS[idx];
        }

        CONCRETE_METHODS
            .iter()
            .copied()
            .max_by(|a, b| {
                let ra = link.method_stats.get(a).map(|s| s.success_rate()).unwrap_or(0.0);
                let rb = link.method_stats.get(b).map(|s| s.success_rate()).unwrap_or(0.0);
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(ProbeMethod::Ping)
    }

    /// The next probe interval: shrinks toward `min_interval` on sustained
    /// health, grows toward `max_interval` once a link is degraded or down.
    pub fn next_interval(&self, wan_id: u8) -> Duration {
        match self.state(wan_id) {
            HealthState::Up => self.config.min_interval,
            HealthState::Unknown | HealthState::Testing => self.config.min_interval,
            HealthState::Degraded | HealthState::Down | HealthState::Recovering => {
                self.config.max_interval
            }
        }
    }

    /// Record the outcome of a probe and return any state transition event.
    ///
    /// `latency_ms`/`loss_rate` are this probe's measured round-trip time
    /// and the link's current rolling loss rate; an `Up` link drops to
    /// `Degraded` the instant either crosses its configured threshold, not
    /// only after a run of consecutive failures.
    pub fn record_result(
        &mut self,
        wan_id: u8,
        method: ProbeMethod,
        success: bool,
        latency_ms: f64,
        loss_rate: f64,
    ) -> Option<HealthEvent> {
        let link = self.links.entry(wan_id).or_insert_with(LinkProbeState::new);
        let stats = link.method_stats.entry(method).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
            link.consecutive_successes += 1;
            link.consecutive_failures = 0;
        } else {
            link.consecutive_failures += 1;
            link.consecutive_successes = 0;
        }

        let from = link.state;
        let to = next_state(
            from,
            success,
            latency_ms,
            loss_rate,
            link.consecutive_failures,
            link.consecutive_successes,
            &self.config,
        );

        if to != from {
            link.state = to;
            debug!(
                wan_id,
                from = from.as_str(),
                to = to.as_str(),
                latency_ms,
                loss_rate,
                "wan health transition"
            );
            Some(HealthEvent::StateChanged { wan_id, from, to })
        } else {
            None
        }
    }
}

fn next_state(
    current: HealthState,
    success: bool,
    latency_ms: f64,
    loss_rate: f64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    config: &HealthConfig,
) -> HealthState {
    let over_threshold = latency_ms > config.degraded_latency_ms || loss_rate > config.degraded_loss;
    match current {
        HealthState::Unknown => HealthState::Testing,
        HealthState::Testing => {
            if !success {
                if consecutive_failures >= config.down_after {
                    HealthState::Down
                } else {
                    HealthState::Testing
                }
            } else if over_threshold {
                HealthState::Degraded
            } else {
                HealthState::Up
            }
        }
        HealthState::Up => {
            if consecutive_failures >= config.degraded_after || over_threshold {
                HealthState::Degraded
            } else {
                HealthState::Up
            }
        }
        HealthState::Degraded => {
            if consecutive_failures >= config.down_after {
                HealthState::Down
            } else if consecutive_successes >= config.recovery_after && !over_threshold {
                HealthState::Up
            } else {
                HealthState::Degraded
            }
        }
        HealthState::Down => {
            if success {
                HealthState::Recovering
            } else {
                HealthState::Down
            }
        }
        HealthState::Recovering => {
            if !success {
                HealthState::Down
            } else if consecutive_successes >= config.recovery_after {
                if over_threshold {
                    HealthState::Degraded
                } else {
                    HealthState::Up
                }
            } else {
                HealthState::Recovering
            }
        }
    }
}
