// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

use proptest::prelude::*;
use rtmfp_crypto::Engine;
use rtmfp_proto::{decode_packet, encode_packet, marker, PacketHeader};

proptest! {
    #[test]
    fn varint_u64_round_trips(value in any::<u64>()) {
        let mut out = Vec::new();
        rtmfp_proto::write_u64(&mut out, value);
        let (decoded, consumed) = rtmfp_proto::read_u64(&out).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, out.len());
    }

    #[test]
    fn varint_u32_round_trips(value in any::<u32>()) {
        let mut out = Vec::new();
        rtmfp_proto::write_u32(&mut out, value);
        let (decoded, consumed) = rtmfp_proto::read_u32(&out).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, out.len());
    }

    #[test]
    fn varint_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..16)) {
        let _ = rtmfp_proto::read_u32(&bytes);
        let _ = rtmfp_proto::read_u64(&bytes);
    }

    #[test]
    fn packet_round_trips_for_any_chunk_body(
        key in prop::array::uniform16(any::<u8>()),
        session_id in any::<u32>(),
        timestamp in any::<u16>(),
        chunks in prop::collection::vec(any::<u8>(), 0..900),
    ) {
        let engine = Engine::new(key);
        let header = PacketHeader { marker: marker::REQUEST, timestamp, time_echo: None };
        let datagram = encode_packet(session_id, &header, &chunks, &engine).unwrap();
        let decoded = decode_packet(&datagram, &engine).unwrap();
        prop_assert_eq!(decoded.session_id, session_id);
        prop_assert_eq!(decoded.header, header);
        prop_assert_eq!(decoded.body, chunks);
    }

    #[test]
    fn decode_packet_never_panics_on_garbage(bytes in prop::collection::vec(any::<u8>(), 0..1200)) {
        let engine = Engine::new([7u8; 16]);
        let _ = decode_packet(&bytes, &engine);
    }
}
