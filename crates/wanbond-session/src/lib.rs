//! # wanbond-session
//!
//! Owns the running bond: the per-WAN UDP sockets, the send/receive task
//! set, the health-probe loop, and the plugin chain, wiring the
//! `wanbond-transport` wire codec/reorder/dedup/FEC and the
//! `wanbond-bonding` health/router/config types into one supervised unit.
//!
//! ## Crate structure
//!
//! - [`plugins`] — the `PacketFilter`/`MetricsCollector`/`AlertManager`
//!   capability set and the manager that fans packets and events out to them
//! - [`session`] — the `Session` supervisor: lifecycle, send pipeline,
//!   per-uplink receive pipeline, FEC grouping, and the health-event loop

pub mod plugins;
pub mod session;
