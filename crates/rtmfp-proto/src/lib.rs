// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire framing for RTMFP: packet headers, the 7-bit-long varint, addresses,
//! peer ids, marker bytes, messages, fragments, flow/ack chunks, handshake
//! chunks, and NetGroup opcodes.
//!
//! This crate only encodes and decodes bytes; it holds no session state and
//! performs no I/O. [`rtmfp_core`](../rtmfp_core/index.html) drives these
//! codecs against live sockets.

mod address;
mod chunk;
mod error;
mod fragment;
mod group;
mod handshake;
mod header;
mod marker;
mod message;
mod peer_id;
mod varint;

pub use address::{Address, AddressKind};
pub use chunk::{
    chunk_type as flow_chunk_type, decode_flow_exception, encode_flow_exception, read_chunk,
    write_chunk, Ack, AckRun, FlowData, FlowOptions, RECEIVE_BUFFER_IDLE,
};
pub use error::ProtoError;
pub use fragment::{
    opcode as media_opcode, Fragment, FragmentFlags, GroupFragment, GroupMarker,
};
pub use group::{
    opcode as group_opcode, signature as group_signature, new_stream_key, EmptyBody,
    FragmentsMap, GroupConfigTlvs, GroupInit, GroupReport, Member, MediaInfo, PlayPull, PlayPush,
    ReportedPeer,
};
pub use handshake::{
    chunk_type as handshake_chunk_type, peek_far_id, Cookie, Credential, Epd, Hs30, Hs38, Hs70,
    Hs71, Hs78, Hs79, Nonce73, Nonce76, Tag, HANDSHAKE_TRAILER,
};
pub use header::{decode_packet, encode_packet, DecodedPacket, PacketHeader, MAX_PACKET_SIZE};
pub use marker::{has_time_echo, is_handshake, is_responder_variant, HANDSHAKE, NORMAL_ECHO,
    P2P_ECHO, P2P_ECHO_ALT, REQUEST, REQUEST_ECHO, RESPONDER, RESPONDER_ECHO};
pub use message::{AmfType, Message, Reliability};
pub use peer_id::{PeerId, RAW_PEER_ID_PREFIX};
pub use varint::{read_7bit_value, read_u32, read_u64, write_7bit_value, write_u32, write_u64,
    CAP_U32, CAP_U64};
