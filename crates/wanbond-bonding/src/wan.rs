//! # WAN interface model
//!
//! The static configuration and dynamic runtime snapshot for a single bonded
//! uplink: smoothed RTT/capacity/loss fields plus an explicit lifecycle
//! phase, generic over any WAN kind (fiber, VDSL, LTE, 5G, satellite, cable).

use crate::health::HealthState;
use serde::{Deserialize, Serialize};

/// The physical/logical medium of a bonded uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WanKind {
    Fiber,
    Vdsl,
    Lte,
    FiveG,
    Satellite,
    Cable,
}

impl WanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WanKind::Fiber => "fiber",
            WanKind::Vdsl => "vdsl",
            WanKind::Lte => "lte",
            WanKind::FiveG => "5g",
            WanKind::Satellite => "satellite",
            WanKind::Cable => "cable",
        }
    }
}

/// Static, operator-supplied configuration for one WAN link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    pub id: u8,
    pub kind: WanKind,
    /// Lower priority value wins ties in failover mode; 0 is primary.
    pub priority: u8,
    /// Weighted-mode share; must be > 0.
    pub weight: u32,
    /// Operator-declared capacity ceiling, if known.
    pub max_bps: Option<u64>,
    /// Administratively enabled. A disabled link is never eligible for
    /// routing regardless of health, but is still probed.
    pub enabled: bool,
}

impl WanConfig {
    pub fn new(id: u8, kind: WanKind, priority: u8, weight: u32) -> Self {
        WanConfig {
            id,
            kind,
            priority,
            weight,
            max_bps: None,
            enabled: true,
        }
    }
}

/// Smoothed runtime telemetry for a WAN link, fed by the health prober and
/// the session's receive-side stats.
#[derive(Debug, Clone, Default)]
pub struct WanMetrics {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_rate: f64,
    pub capacity_bps: f64,
    /// Bytes sent on this link since the last reset, used by the
    /// least-used router mode.
    pub bytes_sent: u64,
}

/// Full runtime state of one WAN link: config + telemetry + health.
#[derive(Debug, Clone)]
pub struct WanState {
    pub config: WanConfig,
    pub metrics: WanMetrics,
    pub health: HealthState,
}

impl WanState {
    pub fn new(config: WanConfig) -> Self {
        WanState {
            config,
            metrics: WanMetrics::default(),
            health: HealthState::Unknown,
        }
    }

    pub fn id(&self) -> u8 {
        self.config.id
    }

    /// A link is routable when it's administratively enabled and the health
    /// prober considers it `Up`, `Degraded`, or `Recovering` — `Down`,
    /// `Unknown`, and `Testing` links are never selected, only probed.
    /// `Recovering` links carry live traffic while accumulating the
    /// successes needed to fully return to `Up`, rather than sitting idle
    /// until recovery completes.
    pub fn is_eligible(&self) -> bool {
        self.config.enabled
            && matches!(
                self.health,
                HealthState::Up | HealthState::Degraded | HealthState::Recovering
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligible_only_when_up_degraded_or_recovering() {
        let mut wan = WanState::new(WanConfig::new(0, WanKind::Lte, 0, 1));
        assert!(!wan.is_eligible());
        wan.health = HealthState::Up;
        assert!(wan.is_eligible());
        wan.health = HealthState::Degraded;
        assert!(wan.is_eligible());
        wan.health = HealthState::Recovering;
        assert!(wan.is_eligible());
        wan.health = HealthState::Down;
        assert!(!wan.is_eligible());
    }

    #[test]
    fn disabled_link_is_never_eligible() {
        let mut wan = WanState::new(WanConfig::new(0, WanKind::Lte, 0, 1));
        wan.health = HealthState::Up;
        assert!(wan.is_eligible());
        wan.config.enabled = false;
        assert!(!wan.is_eligible());
    }

    #[test]
    fn kind_as_str() {
        assert_eq!(WanKind::FiveG.as_str(), "5g");
        assert_eq!(WanKind::Vdsl.as_str(), "vdsl");
    }
}
