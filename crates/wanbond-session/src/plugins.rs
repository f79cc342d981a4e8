//! # Plugin surface
//!
//! The supervisor is polymorphic over three capabilities — packet filters,
//! metrics collectors, and alert sinks — rather than hard-coding any
//! particular observability or shaping stack. A [`PluginManager`] owns an
//! ordered filter chain plus unordered sink lists and fans packets/metrics/
//! alerts out to all registered plugins.
//!
//! Each capability trait follows a default-no-op idiom: a plugin implements
//! only the methods it cares about, the rest fall back to harmless defaults,
//! so adding a capability to a trait never breaks an existing plugin.

use bytes::Bytes;
use std::sync::RwLock;
use wanbond_transport::wire::Packet;

/// Direction a packet was filtered in, passed through to metrics sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Severity of an alert raised by the supervisor (e.g. on a health state
/// change).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

/// Inspects or rewrites packets as they cross the send/receive pipelines.
///
/// Returning `None` drops the packet and halts the rest of the chain for it.
/// Both methods default to a pass-through no-op so a filter that only cares
/// about one direction need not implement the other.
pub trait PacketFilter: Send + Sync {
    fn filter_outgoing(&self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    fn filter_incoming(&self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    /// Stable ordering key; filters run in ascending order, ties broken by
    /// registration order.
    fn priority(&self) -> i32 {
        0
    }
}

/// Receives best-effort broadcasts of packet and metrics activity. Every
/// method is a no-op by default.
pub trait MetricsCollector: Send + Sync {
    fn on_packet(&self, _wan_id: u8, _payload: &Bytes, _direction: Direction) {}
    fn on_wan_metrics(&self, _wan_id: u8, _rtt_ms: f64, _loss_rate: f64) {}
}

/// Receives best-effort alert notifications (e.g. a WAN transitioning to
/// `Down`). A no-op default.
pub trait AlertManager: Send + Sync {
    fn on_alert(&self, _level: AlertLevel, _message: &str, _details: &str) {}
}

/// Owns the ordered filter chain and the unordered metrics/alert sink lists.
///
/// Registration order is preserved for filters with equal priority (a
/// stable sort is used on insert). All sink dispatch is best-effort: one
/// sink panicking or otherwise misbehaving must not stop delivery to the
/// others, so each call is wrapped with `catch_unwind`.
#[derive(Default)]
pub struct PluginManager {
    filters: RwLock<Vec<Box<dyn PacketFilter>>>,
    metrics: RwLock<Vec<Box<dyn MetricsCollector>>>,
    alerts: RwLock<Vec<Box<dyn AlertManager>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        PluginManager::default()
    }

    pub fn register_filter(&self, filter: Box<dyn PacketFilter>) {
        let mut filters = self.filters.write().unwrap_or_else(|e| e.into_inner());
        filters.push(filter);
        filters.sort_by_key(|f| f.priority());
    }

    pub fn register_metrics(&self, sink: Box<dyn MetricsCollector>) {
        self.metrics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    pub fn register_alerts(&self, sink: Box<dyn AlertManager>) {
        self.alerts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Runs the outgoing filter chain in priority order. `None` from any
    /// filter drops the packet and skips the rest of the chain.
    pub fn filter_outgoing(&self, mut packet: Packet) -> Option<Packet> {
        let filters = self.filters.read().unwrap_or_else(|e| e.into_inner());
        for filter in filters.iter() {
            packet = filter.filter_outgoing(packet)?;
        }
        Some(packet)
    }

    pub fn filter_incoming(&self, mut packet: Packet) -> Option<Packet> {
        let filters = self.filters.read().unwrap_or_else(|e| e.into_inner());
        for filter in filters.iter() {
            packet = filter.filter_incoming(packet)?;
        }
        Some(packet)
    }

    pub fn notify_packet(&self, wan_id: u8, payload: &Bytes, direction: Direction) {
        let sinks = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.on_packet(wan_id, payload, direction)
            }));
        }
    }

    pub fn notify_wan_metrics(&self, wan_id: u8, rtt_ms: f64, loss_rate: f64) {
        let sinks = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.on_wan_metrics(wan_id, rtt_ms, loss_rate)
            }));
        }
    }

    pub fn notify_alert(&self, level: AlertLevel, message: &str, details: &str) {
        let sinks = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.on_alert(level, message, details)
            }));
        }
    }
}
