#![no_main]

use libfuzzer_sys::fuzz_target;
use wanbond_transport::wire::Packet;

/// Fuzz the full packet decode pipeline: length check, CRC-32 verification,
/// fixed-header parsing, and payload extraction.
///
/// The decoder must never panic on any input; it should return a
/// `DecodeError` for malformed data.
fuzz_target!(|data: &[u8]| {
    let _ = Packet::decode(data);
});
