//! # Router
//!
//! Pure link-selection logic: given the current eligible WAN candidates,
//! pick a primary (and, where the mode calls for it, an ordered list of
//! backups) for the next packet or flow. Every mode follows the same shape —
//! eligibility filtering followed by a mode-specific selection step — across
//! the seven routing modes below.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The seven link-selection strategies a bond can run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    RoundRobin,
    Weighted,
    LeastUsed,
    LeastLatency,
    PerFlow,
    Adaptive,
    Failover,
}

/// A WAN link as seen by the router at selection time.
#[derive(Debug, Clone)]
pub struct WanCandidate {
    pub id: u8,
    pub priority: u8,
    pub weight: u32,
    pub eligible: bool,
    pub rtt_ms: f64,
    pub loss_rate: f64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub primary: u8,
    /// Only populated for [`RouteMode::Adaptive`] (the single next-best
    /// candidate by score) and [`RouteMode::Failover`] (every other
    /// eligible candidate, in priority order); empty for every other mode.
    pub backups: Vec<u8>,
    /// Whether the sender should also emit FEC parity for this packet:
    /// `fec_enabled` and the weighted-average loss rate across all eligible
    /// candidates crossed `fec_loss_threshold`.
    pub use_fec: bool,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mode: RouteMode,
    /// Loss rate above which FEC parity is triggered for the selected link.
    pub fec_loss_threshold: f64,
    /// Master switch for FEC; `use_fec` is never set when this is `false`
    /// regardless of observed loss.
    pub fec_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            mode: RouteMode::Adaptive,
            fec_loss_threshold: 0.02,
            fec_enabled: true,
        }
    }
}

pub struct Router {
    config: RouterConfig,
    round_robin_cursor: usize,
    weighted_credits: std::collections::HashMap<u8, i64>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Router {
            config,
            round_robin_cursor: 0,
            weighted_credits: std::collections::HashMap::new(),
        }
    }

    pub fn set_mode(&mut self, mode: RouteMode) {
        self.config.mode = mode;
    }

    /// Select a primary link (and backups, for modes that produce them)
    /// from `candidates`. `flow_key` is used by [`RouteMode::PerFlow`] to
    /// consistently pin a flow to one link. Returns `None` if no candidate
    /// is eligible.
    pub fn route(
        &mut self,
        candidates: &[WanCandidate],
        flow_key: Option<u64>,
    ) -> Option<RouteDecision> {
        let eligible: Vec<&WanCandidate> = candidates.iter().filter(|c| c.eligible).collect();
        if eligible.is_empty() {
            return None;
        }

        let primary = match self.config.mode {
            RouteMode::RoundRobin => self.pick_round_robin(&eligible),
            RouteMode::Weighted => self.pick_weighted(&eligible),
            RouteMode::LeastUsed => pick_least_used(&eligible),
            RouteMode::LeastLatency => pick_least_latency(&eligible),
            RouteMode::PerFlow => pick_per_flow(&eligible, flow_key.unwrap_or(0)),
            RouteMode::Adaptive => pick_adaptive(&eligible),
            RouteMode::Failover => pick_failover(&eligible),
        };

        let backups: Vec<u8> = match self.config.mode {
            RouteMode::Adaptive => eligible
                .iter()
                .filter(|c| c.id != primary.id)
                .min_by(|a, b| score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal))
                .map(|c| vec![c.id])
                .unwrap_or_default(),
            RouteMode::Failover => {
                let mut backups: Vec<u8> = eligible
                    .iter()
                    .map(|c| c.id)
                    .filter(|&id| id != primary.id)
                    .collect();
                backups.sort_by_key(|&id| {
                    eligible
                        .iter()
                        .find(|c| c.id == id)
                        .map(|c| c.priority)
                        .unwrap_or(u8::MAX)
                });
                backups
            }
            _ => Vec::new(),
        };

        let total_weight: f64 = eligible.iter().map(|c| c.weight.max(1) as f64).sum();
        let weighted_loss: f64 = eligible
            .iter()
            .map(|c| c.loss_rate * c.weight.max(1) as f64)
            .sum::<f64>()
            / total_weight;

        Some(RouteDecision {
            primary: primary.id,
            backups,
            use_fec: self.config.fec_enabled && weighted_loss > self.config.fec_loss_threshold,
        })
    }

    fn pick_round_robin<'a>(&mut self, eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
        let idx = self.round_robin_cursor % eligible.len();
        self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
        eligible[idx]
    }

    /// Weighted round robin: accumulate credit by `weight` each round, pick
    /// the candidate with the highest credit, then deduct a full round's
    /// worth from it.
    fn pick_weighted<'a>(&mut self, eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
        for c in eligible {
            *self.weighted_credits.entry(c.id).or_insert(0) += c.weight as i64;
        }
        let winner = eligible
            .iter()
            .max_by_key(|c| self.weighted_credits.get(&c.id).copied().unwrap_or(0))
            .expect("eligible is non-empty");
        let total_weight: i64 = eligible.iter().map(|c| c.weight as i64).sum();
        if let Some(credit) = self.weighted_credits.get_mut(&winner.id) {
            *credit -= total_weight;
        }
        winner
    }
}

fn pick_least_used<'a>(eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
    eligible
        .iter()
        .min_by_key(|c| c.bytes_sent)
        .expect("eligible is non-empty")
}

fn pick_least_latency<'a>(eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
    eligible
        .iter()
        .min_by(|a, b| a.rtt_ms.partial_cmp(&b.rtt_ms).unwrap_or(std::cmp::Ordering::Equal))
        .expect("eligible is non-empty")
}

fn pick_per_flow<'a>(eligible: &[&'a WanCandidate], flow_key: u64) -> &'a WanCandidate {
    let mut hasher = DefaultHasher::new();
    flow_key.hash(&mut hasher);
    let idx = (hasher.finish() as usize) % eligible.len();
    eligible[idx]
}

/// Composite score blending latency and loss, favoring links that are both
/// fast and clean; weight breaks ties between otherwise-similar links.
fn pick_adaptive<'a>(eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
    eligible
        .iter()
        .min_by(|a, b| score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal))
        .expect("eligible is non-empty")
}

fn score(c: &WanCandidate) -> f64 {
    c.rtt_ms * (1.0 + c.loss_rate * 10.0) / (c.weight.max(1) as f64)
}

fn pick_failover<'a>(eligible: &[&'a WanCandidate]) -> &'a WanCandidate {
    eligible
        .iter()
        .min_by_key(|c| c.priority)
        .expect("eligible is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u8, priority: u8, weight: u32, rtt_ms: f64, loss_rate: f64) -> WanCandidate {
        WanCandidate {
            id,
            priority,
            weight,
            eligible: true,
            rtt_ms,
            loss_rate,
            bytes_sent: 0,
        }
    }

    #[test]
    fn no_eligible_candidates_returns_none() {
        let mut router = Router::new(RouterConfig::default());
        let candidates = vec![WanCandidate {
            eligible: false,
            ..candidate(1, 0, 1, 10.0, 0.0)
        }];
        assert!(router.route(&candidates, None).is_none());
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::RoundRobin,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 0, 1, 10.0, 0.0),
            candidate(2, 0, 1, 10.0, 0.0),
            candidate(3, 0, 1, 10.0, 0.0),
        ];
        let picks: Vec<u8> = (0..6)
            .map(|_| router.route(&candidates, None).unwrap().primary)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn failover_always_prefers_lowest_priority() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Failover,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 2, 1, 10.0, 0.0),
            candidate(2, 0, 1, 10.0, 0.0),
            candidate(3, 1, 1, 10.0, 0.0),
        ];
        let decision = router.route(&candidates, None).unwrap();
        assert_eq!(decision.primary, 2);
        assert_eq!(decision.backups, vec![3, 1]);
    }

    #[test]
    fn least_latency_picks_lowest_rtt() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::LeastLatency,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 0, 1, 80.0, 0.0),
            candidate(2, 0, 1, 20.0, 0.0),
            candidate(3, 0, 1, 50.0, 0.0),
        ];
        assert_eq!(router.route(&candidates, None).unwrap().primary, 2);
    }

    #[test]
    fn least_used_picks_fewest_bytes_sent() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::LeastUsed,
            ..Default::default()
        });
        let candidates = vec![
            WanCandidate { bytes_sent: 9000, ..candidate(1, 0, 1, 10.0, 0.0) },
            WanCandidate { bytes_sent: 100, ..candidate(2, 0, 1, 10.0, 0.0) },
        ];
        assert_eq!(router.route(&candidates, None).unwrap().primary, 2);
    }

    #[test]
    fn per_flow_is_sticky_for_the_same_flow_key() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::PerFlow,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 0, 1, 10.0, 0.0),
            candidate(2, 0, 1, 10.0, 0.0),
            candidate(3, 0, 1, 10.0, 0.0),
        ];
        let first = router.route(&candidates, Some(0xDEADBEEF)).unwrap().primary;
        for _ in 0..5 {
            let again = router.route(&candidates, Some(0xDEADBEEF)).unwrap().primary;
            assert_eq!(again, first);
        }
    }

    #[test]
    fn weighted_favors_higher_weight_over_many_rounds() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Weighted,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 0, 3, 10.0, 0.0),
            candidate(2, 0, 1, 10.0, 0.0),
        ];
        let mut counts = std::collections::HashMap::new();
        for _ in 0..40 {
            let primary = router.route(&candidates, None).unwrap().primary;
            *counts.entry(primary).or_insert(0) += 1;
        }
        assert!(counts[&1] > counts[&2]);
    }

    #[test]
    fn high_loss_triggers_fec() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Failover,
            fec_loss_threshold: 0.05,
            fec_enabled: true,
        });
        let candidates = vec![candidate(1, 0, 1, 10.0, 0.10)];
        let decision = router.route(&candidates, None).unwrap();
        assert!(decision.use_fec);
    }

    #[test]
    fn low_loss_does_not_trigger_fec() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Failover,
            fec_loss_threshold: 0.05,
            fec_enabled: true,
        });
        let candidates = vec![candidate(1, 0, 1, 10.0, 0.001)];
        let decision = router.route(&candidates, None).unwrap();
        assert!(!decision.use_fec);
    }

    #[test]
    fn fec_disabled_suppresses_fec_even_with_high_loss() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Failover,
            fec_loss_threshold: 0.05,
            fec_enabled: false,
        });
        let candidates = vec![candidate(1, 0, 1, 10.0, 0.10)];
        let decision = router.route(&candidates, None).unwrap();
        assert!(!decision.use_fec);
    }

    #[test]
    fn fec_gate_uses_weighted_average_loss_across_eligible_links_not_just_primary() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Failover,
            fec_loss_threshold: 0.05,
            fec_enabled: true,
        });
        // Primary (lowest priority) has zero loss, but the other eligible
        // link is loud enough to push the weighted average over threshold.
        let candidates = vec![
            candidate(1, 0, 1, 10.0, 0.0),
            candidate(2, 1, 1, 10.0, 0.20),
        ];
        let decision = router.route(&candidates, None).unwrap();
        assert_eq!(decision.primary, 1);
        assert!(decision.use_fec);
    }

    #[test]
    fn round_robin_and_weighted_modes_never_populate_backups() {
        let candidates = vec![
            candidate(1, 0, 1, 10.0, 0.0),
            candidate(2, 0, 1, 10.0, 0.0),
            candidate(3, 0, 1, 10.0, 0.0),
        ];
        for mode in [RouteMode::RoundRobin, RouteMode::Weighted, RouteMode::LeastUsed, RouteMode::LeastLatency, RouteMode::PerFlow] {
            let mut router = Router::new(RouterConfig { mode, ..Default::default() });
            let decision = router.route(&candidates, Some(0)).unwrap();
            assert!(decision.backups.is_empty(), "mode {mode:?} should have no backups");
        }
    }

    #[test]
    fn adaptive_backup_is_the_single_next_best_scorer() {
        let mut router = Router::new(RouterConfig {
            mode: RouteMode::Adaptive,
            ..Default::default()
        });
        let candidates = vec![
            candidate(1, 0, 1, 10.0, 0.0),
            candidate(2, 0, 1, 20.0, 0.0),
            candidate(3, 0, 1, 30.0, 0.0),
        ];
        let decision = router.route(&candidates, None).unwrap();
        assert_eq!(decision.primary, 1);
        assert_eq!(decision.backups, vec![2]);
    }
}
