//! # Bond configuration
//!
//! Typed configuration for a bonded session: the WAN set, routing mode,
//! health prober tuning, and FEC/reorder/dedup sizing. Plain structs with a
//! `Default` impl carrying sensible constants, no builder; `serde` + `toml`
//! for (de)serialization.

use crate::health::HealthConfig;
use crate::router::RouteMode;
use crate::wan::WanConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::time::Duration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bond must declare at least one WAN link")]
    NoWans,
    #[error("duplicate WAN id {0}")]
    DuplicateWanId(u8),
    #[error("WAN {0} has weight 0, which is never selectable under weighted routing")]
    ZeroWeight(u8),
    #[error("FEC k and m must both be greater than zero")]
    InvalidFec,
    #[error("reorder buffer capacity must be greater than zero")]
    InvalidReorderCapacity,
    #[error("no socket endpoint supplied for WAN {0}")]
    MissingEndpoint(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FecConfig {
    /// Master switch; the router never sets `use_fec` when this is `false`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub k: usize,
    pub m: usize,
    /// Abandon a partial FEC group (sending no parity for it) after this
    /// many milliseconds if fewer than `k` data shards have accumulated.
    pub group_deadline_ms: u64,
}

fn default_true() -> bool {
    true
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            enabled: true,
            k: 8,
            m: 2,
            group_deadline_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderConfig {
    pub capacity: usize,
    pub timeout_ms: u64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        ReorderConfig {
            capacity: 256,
            timeout_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            max_size: 4096,
            ttl_ms: 1000,
        }
    }
}

/// Routing mode as it appears in an external config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteModeConfig {
    RoundRobin,
    Weighted,
    LeastUsed,
    LeastLatency,
    PerFlow,
    Adaptive,
    Failover,
}

/// Deserializes leniently: an unrecognized mode string falls back to
/// `Adaptive` with a logged warning rather than failing config load, since a
/// typo'd routing mode shouldn't take the whole bond down.
impl<'de> Deserialize<'de> for RouteModeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "round_robin" => RouteModeConfig::RoundRobin,
            "weighted" => RouteModeConfig::Weighted,
            "least_used" => RouteModeConfig::LeastUsed,
            "least_latency" => RouteModeConfig::LeastLatency,
            "per_flow" => RouteModeConfig::PerFlow,
            "adaptive" => RouteModeConfig::Adaptive,
            "failover" => RouteModeConfig::Failover,
            other => {
                tracing::warn!(mode = other, "unrecognized routing mode, falling back to adaptive");
                RouteModeConfig::Adaptive
            }
        })
    }
}

impl From<RouteModeConfig> for RouteMode {
    fn from(value: RouteModeConfig) -> Self {
        match value {
            RouteModeConfig::RoundRobin => RouteMode::RoundRobin,
            RouteModeConfig::Weighted => RouteMode::Weighted,
            RouteModeConfig::LeastUsed => RouteMode::LeastUsed,
            RouteModeConfig::LeastLatency => RouteMode::LeastLatency,
            RouteModeConfig::PerFlow => RouteMode::PerFlow,
            RouteModeConfig::Adaptive => RouteMode::Adaptive,
            RouteModeConfig::Failover => RouteMode::Failover,
        }
    }
}

/// How the receive side adjudicates a payload that arrives redundantly on
/// more than one uplink (FEC-recovered duplicates, or a future full-traffic
/// duplication mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMode {
    /// Deliver whichever copy arrives first, drop the rest.
    First,
    /// Deliver the copy with the lowest observed link latency.
    Fastest,
    /// Deliver the copy from the link with the best composite health score.
    Best,
}

impl Default for DuplicateMode {
    fn default() -> Self {
        DuplicateMode::First
    }
}

/// Which part of a packet or flow a [`RoutingPolicy`] matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Source,
    Destination,
    Application,
}

/// A pinning rule: traffic matching `match_value` on `kind` is sent on
/// `target_wan`, overriding the router's normal mode selection. Policies are
/// evaluated in ascending `priority` order; the first enabled match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub kind: PolicyKind,
    #[serde(rename = "match")]
    pub match_value: String,
    pub target_wan: u8,
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondConfig {
    pub wans: Vec<WanConfig>,
    pub route_mode: RouteModeConfig,
    pub fec_loss_threshold: f64,
    /// How the receive side handles a payload that arrives redundantly on
    /// more than one uplink.
    #[serde(default)]
    pub duplicate_mode: DuplicateMode,
    /// Source/destination/application pinning rules that override
    /// `route_mode` when matched.
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
    #[serde(default)]
    pub fec: FecConfig,
    #[serde(default)]
    pub reorder: ReorderConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(skip, default = "default_health")]
    pub health: HealthConfigToml,
}

/// `HealthConfig` doesn't derive `Serialize`/`Deserialize` (it holds
/// `Duration`s in milliseconds at the wire boundary instead), so the config
/// file carries this toml-friendly mirror and converts on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfigToml {
    pub degraded_after: u32,
    pub down_after: u32,
    pub recovery_after: u32,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub epsilon: f64,
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: f64,
    #[serde(default = "default_degraded_loss")]
    pub degraded_loss: f64,
}

fn default_degraded_latency_ms() -> f64 {
    HealthConfig::default().degraded_latency_ms
}

fn default_degraded_loss() -> f64 {
    HealthConfig::default().degraded_loss
}

impl Default for HealthConfigToml {
    fn default() -> Self {
        let d = HealthConfig::default();
        HealthConfigToml {
            degraded_after: d.degraded_after,
            down_after: d.down_after,
            recovery_after: d.recovery_after,
            min_interval_ms: d.min_interval.as_millis() as u64,
            max_interval_ms: d.max_interval.as_millis() as u64,
            epsilon: d.epsilon,
            degraded_latency_ms: d.degraded_latency_ms,
            degraded_loss: d.degraded_loss,
        }
    }
}

fn default_health() -> HealthConfigToml {
    HealthConfigToml::default()
}

impl From<&HealthConfigToml> for HealthConfig {
    fn from(value: &HealthConfigToml) -> Self {
        HealthConfig {
            degraded_after: value.degraded_after,
            down_after: value.down_after,
            recovery_after: value.recovery_after,
            min_interval: Duration::from_millis(value.min_interval_ms),
            max_interval: Duration::from_millis(value.max_interval_ms),
            epsilon: value.epsilon,
            degraded_latency_ms: value.degraded_latency_ms,
            degraded_loss: value.degraded_loss,
        }
    }
}

impl BondConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wans.is_empty() {
            return Err(ConfigError::NoWans);
        }

        let mut seen = std::collections::HashSet::new();
        for wan in &self.wans {
            if !seen.insert(wan.id) {
                return Err(ConfigError::DuplicateWanId(wan.id));
            }
            if self.route_mode == RouteModeConfig::Weighted && wan.weight == 0 {
                return Err(ConfigError::ZeroWeight(wan.id));
            }
        }

        if self.fec.k == 0 || self.fec.m == 0 {
            return Err(ConfigError::InvalidFec);
        }
        if self.reorder.capacity == 0 {
            return Err(ConfigError::InvalidReorderCapacity);
        }

        Ok(())
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::from(&self.health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wan::WanKind;

    fn valid_config() -> BondConfig {
        BondConfig {
            wans: vec![
                WanConfig::new(0, WanKind::Fiber, 0, 1),
                WanConfig::new(1, WanKind::Lte, 1, 1),
            ],
            route_mode: RouteModeConfig::Adaptive,
            fec_loss_threshold: 0.02,
            duplicate_mode: DuplicateMode::default(),
            policies: Vec::new(),
            fec: FecConfig::default(),
            reorder: ReorderConfig::default(),
            dedup: DedupConfig::default(),
            health: HealthConfigToml::default(),
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_wans_is_rejected() {
        let mut config = valid_config();
        config.wans.clear();
        assert_eq!(config.validate().unwrap_err(), ConfigError::NoWans);
    }

    #[test]
    fn duplicate_wan_id_is_rejected() {
        let mut config = valid_config();
        config.wans[1].id = 0;
        assert_eq!(config.validate().unwrap_err(), ConfigError::DuplicateWanId(0));
    }

    #[test]
    fn zero_weight_rejected_only_under_weighted_mode() {
        let mut config = valid_config();
        config.wans[0].weight = 0;
        assert!(config.validate().is_ok(), "adaptive mode ignores weight");

        config.route_mode = RouteModeConfig::Weighted;
        assert_eq!(config.validate().unwrap_err(), ConfigError::ZeroWeight(0));
    }

    #[test]
    fn invalid_fec_shape_is_rejected() {
        let mut config = valid_config();
        config.fec.k = 0;
        assert_eq!(config.validate().unwrap_err(), ConfigError::InvalidFec);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = valid_config();
        let text = toml::to_string(&config).unwrap();
        let parsed: BondConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.wans.len(), 2);
        assert_eq!(parsed.route_mode, RouteModeConfig::Adaptive);
    }

    #[test]
    fn health_config_converts_milliseconds_to_duration() {
        let config = valid_config();
        let health = config.health_config();
        assert_eq!(health.min_interval, Duration::from_millis(200));
    }

    #[test]
    fn unknown_route_mode_falls_back_to_adaptive() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RouteModeConfig,
        }
        let wrapper: Wrapper = toml::from_str("mode = \"bogus\"").unwrap();
        assert_eq!(wrapper.mode, RouteModeConfig::Adaptive);
    }

    #[test]
    fn known_route_modes_round_trip_through_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RouteModeConfig,
        }
        let wrapper: Wrapper = toml::from_str("mode = \"least_latency\"").unwrap();
        assert_eq!(wrapper.mode, RouteModeConfig::LeastLatency);
    }

    #[test]
    fn policies_and_duplicate_mode_round_trip_through_toml() {
        let mut config = valid_config();
        config.duplicate_mode = DuplicateMode::Fastest;
        config.policies.push(RoutingPolicy {
            kind: PolicyKind::Destination,
            match_value: "10.0.0.0/8".to_string(),
            target_wan: 0,
            priority: 1,
            enabled: true,
        });
        let text = toml::to_string(&config).unwrap();
        let parsed: BondConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.duplicate_mode, DuplicateMode::Fastest);
        assert_eq!(parsed.policies.len(), 1);
        assert_eq!(parsed.policies[0].target_wan, 0);
    }
}
