//! # wanbond-transport
//!
//! Wire framing and the per-packet reliability primitives for the bonding
//! dataplane: a fixed 38-byte header with a trailing CRC-32 checksum, a
//! bounded out-of-order reorder buffer, a TTL-windowed dedup cache, a
//! nanosecond clock/sequence generator, and a systematic Reed-Solomon FEC
//! codec.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header encode/decode, CRC-32 framing
//! - [`clock`] — Wall clock and sequence number generation
//! - [`reorder`] — Bounded, timeout-swept reorder buffer
//! - [`dedup`] — TTL-windowed duplicate sequence cache
//! - [`codec`] — Systematic Reed-Solomon FEC over GF(2^8)
//! - [`stats`] — Per-WAN and aggregate statistics

pub mod clock;
pub mod codec;
pub mod dedup;
pub mod reorder;
pub mod stats;
pub mod wire;
