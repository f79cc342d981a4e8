#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use wanbond_transport::wire::{Flags, Packet, PacketHeader, PacketType, PROTOCOL_VERSION};

/// Every header built from arbitrary field values must survive an
/// encode/decode roundtrip unchanged.
fuzz_target!(|input: (u64, u64, i64, u8, u8, u32, Vec<u8>)| {
    let (session_id, sequence_id, timestamp_ns, wan_id, priority, group_id, payload) = input;
    let packet = Packet::new(
        PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Data,
            flags: Flags::empty(),
            session_id,
            sequence_id,
            timestamp_ns,
            wan_id,
            priority,
            data_len: 0,
            group_id,
        },
        Bytes::from(payload),
    );

    let encoded = packet.encode();
    let decoded = Packet::decode(&encoded).expect("a packet we just encoded must decode");
    assert_eq!(decoded, packet);
});
