// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! NetGroup writer signatures and the opcode byte stream carried on each
//! (§4.8). Media fragment opcodes (`MEDIA_*`) live in [`crate::fragment`];
//! everything else in the §4.8 table lives here.

use bytes::Bytes;

use crate::address::Address;
use crate::error::ProtoError;
use crate::peer_id::PeerId;
use crate::varint::{read_u32, read_u64, write_u32, write_u64};

/// The four distinguished writer signatures every peer session carries for
/// group purposes (§4.8 table).
pub mod signature {
    /// Membership & lifecycle control.
    pub const REPORT: [u8; 4] = [0x00, 0x47, 0x52, 0x1C];
    /// GroupMedia subscription, fragments-map, pull requests, push-mode.
    pub const MEDIA_REPORT: [u8; 4] = [0x00, 0x47, 0x52, 0x11];
    /// Actual fragment delivery.
    pub const MEDIA: [u8; 4] = [0x00, 0x47, 0x52, 0x12];
    /// Reserved data channel.
    pub const DATA: [u8; 4] = [0x00, 0x47, 0x52, 0x19];
}

/// Per-message opcode bytes inside a Group writer's byte stream (§4.8 table).
pub mod opcode {
    /// `GROUP_INIT`.
    pub const GROUP_INIT: u8 = 0x01;
    /// `ABORT`.
    pub const ABORT: u8 = 0x02;
    /// `GROUP_REPORT`.
    pub const GROUP_REPORT: u8 = 0x0A;
    /// `MEMBER`.
    pub const MEMBER: u8 = 0x0B;
    /// `ASK_CLOSE`.
    pub const ASK_CLOSE: u8 = 0x0C;
    /// `BEGIN`.
    pub const BEGIN: u8 = 0x0E;
    /// `BEGIN_NEAREST`.
    pub const BEGIN_NEAREST: u8 = 0x0F;
    /// `MEDIA_INFO`.
    pub const MEDIA_INFO: u8 = 0x21;
    /// `FRAGMENTS_MAP`.
    pub const FRAGMENTS_MAP: u8 = 0x22;
    /// `PLAY_PUSH`.
    pub const PLAY_PUSH: u8 = 0x23;
    /// `PLAY_PULL`.
    pub const PLAY_PULL: u8 = 0x2B;
}

/// `GROUP_INIT` payload: `4100 || groupIdHex(64) || 2101 || key(32) || 2303
/// || rawPeerId(34)` (§4.8.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInit {
    /// Hex-encoded (64 ASCII chars) group id.
    pub group_id_hex: String,
    /// HMAC key proving knowledge of the shared secret + nonce (§4.8.1).
    pub key: [u8; 32],
    /// Sender's raw peer id.
    pub peer_id: PeerId,
}

const GROUP_INIT_MARK1: [u8; 2] = [0x41, 0x00];
const GROUP_INIT_MARK2: [u8; 2] = [0x21, 0x01];
const GROUP_INIT_MARK3: [u8; 2] = [0x23, 0x03];

impl GroupInit {
    /// Encode this message's body (without the leading `GROUP_INIT` opcode
    /// byte, which the caller's chunk/flow framing supplies).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 64 + 2 + 32 + 2 + 34);
        out.extend_from_slice(&GROUP_INIT_MARK1);
        out.extend_from_slice(self.group_id_hex.as_bytes());
        out.extend_from_slice(&GROUP_INIT_MARK2);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&GROUP_INIT_MARK3);
        self.peer_id.encode_raw(&mut out);
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 2 + 64 + 2 + 32 + 2 + 34 {
            return Err(ProtoError::Truncated);
        }
        if buf[0..2] != GROUP_INIT_MARK1 {
            return Err(ProtoError::UnknownSignature);
        }
        let group_id_hex = String::from_utf8_lossy(&buf[2..66]).into_owned();
        if buf[66..68] != GROUP_INIT_MARK2 {
            return Err(ProtoError::UnknownSignature);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[68..100]);
        if buf[100..102] != GROUP_INIT_MARK3 {
            return Err(ProtoError::UnknownSignature);
        }
        let (peer_id, _) = PeerId::decode_raw(&buf[102..])?;
        Ok(Self {
            group_id_hex,
            key,
            peer_id,
        })
    }
}

/// NetGroup config TLVs carried in `MEDIA_INFO` (§4.9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfigTlvs {
    /// `03`: window duration, milliseconds.
    pub window_duration_ms: u32,
    /// `05`: availability update period, milliseconds.
    pub availability_update_period_ms: u32,
    /// `06`: send fragments-map to every peer rather than one at random.
    pub availability_send_to_all: bool,
    /// `07`: fetch period, milliseconds.
    pub fetch_period_ms: u32,
}

const TLV_WINDOW: u8 = 0x03;
const TLV_OBJECT_ENCODING: u8 = 0x04;
const OBJECT_ENCODING_FIXED: [u8; 3] = [0x92, 0xA7, 0x60];
const TLV_UPDATE_PERIOD: u8 = 0x05;
const TLV_SEND_TO_ALL: u8 = 0x06;
const TLV_FETCH_PERIOD: u8 = 0x07;
const TLV_END: u8 = 0x00;

impl GroupConfigTlvs {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TLV_WINDOW);
        write_u32(out, self.window_duration_ms);
        out.push(TLV_OBJECT_ENCODING);
        out.extend_from_slice(&OBJECT_ENCODING_FIXED);
        out.push(TLV_UPDATE_PERIOD);
        write_u32(out, self.availability_update_period_ms);
        out.push(TLV_SEND_TO_ALL);
        out.push(u8::from(self.availability_send_to_all));
        out.push(TLV_FETCH_PERIOD);
        write_u32(out, self.fetch_period_ms);
        out.push(TLV_END);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        let mut cfg = Self {
            window_duration_ms: 0,
            availability_update_period_ms: 100,
            availability_send_to_all: false,
            fetch_period_ms: 2500,
        };
        let mut pos = 0;
        loop {
            let tag = *buf.get(pos).ok_or(ProtoError::Truncated)?;
            pos += 1;
            match tag {
                TLV_END => break,
                TLV_WINDOW => {
                    let (v, n) = read_u32(&buf[pos..])?;
                    cfg.window_duration_ms = v;
                    pos += n;
                }
                TLV_OBJECT_ENCODING => {
                    if buf.len() < pos + 3 {
                        return Err(ProtoError::Truncated);
                    }
                    pos += 3;
                }
                TLV_UPDATE_PERIOD => {
                    let (v, n) = read_u32(&buf[pos..])?;
                    cfg.availability_update_period_ms = v;
                    pos += n;
                }
                TLV_SEND_TO_ALL => {
                    let flag = *buf.get(pos).ok_or(ProtoError::Truncated)?;
                    cfg.availability_send_to_all = flag != 0;
                    pos += 1;
                }
                TLV_FETCH_PERIOD => {
                    let (v, n) = read_u32(&buf[pos..])?;
                    cfg.fetch_period_ms = v;
                    pos += n;
                }
                other => return Err(ProtoError::UnknownChunk(other)),
            }
        }
        Ok((cfg, pos))
    }
}

/// `MEDIA_INFO` payload: subscription advertisement for a stream (§4.9.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// Stream name (length-prefixed on the wire with a `0x00` marker byte).
    pub stream_name: String,
    /// 34-byte stream key (`21 01 || 32 random`).
    pub stream_key: [u8; 34],
    /// Group config TLVs.
    pub config: GroupConfigTlvs,
}

const STREAM_NAME_MARK: u8 = 0x00;

impl MediaInfo {
    /// Encode this message's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(STREAM_NAME_MARK);
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.stream_name.len() as u8);
        out.extend_from_slice(self.stream_name.as_bytes());
        out.extend_from_slice(&self.stream_key);
        self.config.encode(&mut out);
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 2 {
            return Err(ProtoError::Truncated);
        }
        if buf[0] != STREAM_NAME_MARK {
            return Err(ProtoError::UnknownSignature);
        }
        let name_len = usize::from(buf[1]);
        if buf.len() < 2 + name_len + 34 {
            return Err(ProtoError::Truncated);
        }
        let stream_name = String::from_utf8_lossy(&buf[2..2 + name_len]).into_owned();
        let mut stream_key = [0u8; 34];
        stream_key.copy_from_slice(&buf[2 + name_len..2 + name_len + 34]);
        let (config, _) = GroupConfigTlvs::decode(&buf[2 + name_len + 34..])?;
        Ok(Self {
            stream_name,
            stream_key,
            config,
        })
    }
}

/// Build a 34-byte stream key: `21 01 || 32 random` (§4.9.1).
#[must_use]
pub fn new_stream_key(random32: [u8; 32]) -> [u8; 34] {
    let mut key = [0u8; 34];
    key[0] = 0x21;
    key[1] = 0x01;
    key[2..].copy_from_slice(&random32);
    key
}

/// `FRAGMENTS_MAP` payload: `lastId(7bitlong) || bitmap` (§4.9.3).
///
/// Bit `b` of byte `i` indicates presence of fragment `lastId - 1 - (8*i +
/// b)`, least-significant bit of each byte corresponding to the oldest
/// fragment in that byte's range (§9 "`fragmentsMap` bit layout").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentsMap {
    /// Highest fragment id the sender holds.
    pub last_id: u64,
    /// Presence bitmap for `lastId-1` downward.
    pub bitmap: Vec<u8>,
}

impl FragmentsMap {
    /// Encode this message's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, self.last_id);
        out.extend_from_slice(&self.bitmap);
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (last_id, n) = read_u64(buf)?;
        Ok(Self {
            last_id,
            bitmap: buf[n..].to_vec(),
        })
    }

    /// Whether `id` is marked present in the bitmap.
    #[must_use]
    pub fn has(&self, id: u64) -> bool {
        if id >= self.last_id {
            return id == self.last_id;
        }
        let distance = self.last_id - 1 - id;
        let byte_index = (distance / 8) as usize;
        let bit_index = (distance % 8) as u32;
        self.bitmap
            .get(byte_index)
            .is_some_and(|byte| byte & (1 << bit_index) != 0)
    }

    /// Build a fragments map from an ascending-sorted set of held ids and
    /// the current `last_id`, covering `depth` fragments below it.
    #[must_use]
    pub fn build(last_id: u64, held_ids: &[u64], depth: usize) -> Self {
        let byte_len = depth.div_ceil(8);
        let mut bitmap = vec![0u8; byte_len];
        for &id in held_ids {
            if id >= last_id {
                continue;
            }
            let distance = last_id - 1 - id;
            if distance as usize >= depth {
                continue;
            }
            let byte_index = (distance / 8) as usize;
            let bit_index = (distance % 8) as u32;
            bitmap[byte_index] |= 1 << bit_index;
        }
        Self { last_id, bitmap }
    }
}

/// `PLAY_PUSH` payload: an 8-bit residue-class mask (§4.9.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayPush {
    /// Bit `b` set means "push me fragments whose `id mod 8 == b`".
    pub mode: u8,
}

impl PlayPush {
    /// Encode this message's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        vec![self.mode]
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self {
            mode: *buf.first().ok_or(ProtoError::Truncated)?,
        })
    }
}

/// `PLAY_PULL` payload: a single requested fragment id (§4.9.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayPull {
    /// Requested fragment id.
    pub id: u64,
}

impl PlayPull {
    /// Encode this message's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, self.id);
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (id, _) = read_u64(buf)?;
        Ok(Self { id })
    }
}

/// `MEMBER` payload: a bare raw peer id announcement (§4.8 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// Announced peer.
    pub peer_id: PeerId,
}

impl Member {
    /// Encode this message's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        self.peer_id.encode_raw(&mut out);
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (peer_id, _) = PeerId::decode_raw(buf)?;
        Ok(Self { peer_id })
    }
}

/// One advertised peer entry inside a `GROUP_REPORT` (§4.8.2): `0x22,
/// rawPeerId, timeSinceLastReportSeconds(7bitlong), addressBlockSize,
/// 0x0A, [hostAddr as REDIRECTION,] *(addr as type), 0x00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedPeer {
    /// The peer being advertised.
    pub peer_id: PeerId,
    /// Seconds since we last heard from/about this peer.
    pub time_since_last_report_secs: u32,
    /// Host (REDIRECTION-class) address, if known.
    pub host_address: Option<Address>,
    /// Other known addresses.
    pub addresses: Vec<Address>,
}

const REPORTED_PEER_MARK: u8 = 0x22;
const ADDRESS_BLOCK_MARK: u8 = 0x0A;
const REPORTED_PEER_END: u8 = 0x00;

impl ReportedPeer {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(REPORTED_PEER_MARK);
        self.peer_id.encode_raw(out);
        write_u32(out, self.time_since_last_report_secs);
        let mut block = Vec::new();
        if let Some(host) = &self.host_address {
            host.encode(&mut block);
        }
        for addr in &self.addresses {
            addr.encode(&mut block);
        }
        #[allow(clippy::cast_possible_truncation)]
        out.push(block.len() as u8);
        out.push(ADDRESS_BLOCK_MARK);
        out.extend_from_slice(&block);
        out.push(REPORTED_PEER_END);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        if buf.first() != Some(&REPORTED_PEER_MARK) {
            return Err(ProtoError::UnknownChunk(*buf.first().unwrap_or(&0)));
        }
        let mut pos = 1;
        let (peer_id, n) = PeerId::decode_raw(&buf[pos..])?;
        pos += n;
        let (time_since, n) = read_u32(&buf[pos..])?;
        pos += n;
        let block_size = usize::from(*buf.get(pos).ok_or(ProtoError::Truncated)?);
        pos += 1;
        if *buf.get(pos).ok_or(ProtoError::Truncated)? != ADDRESS_BLOCK_MARK {
            return Err(ProtoError::UnknownSignature);
        }
        pos += 1;
        let block_end = pos + block_size;
        if buf.len() < block_end + 1 {
            return Err(ProtoError::Truncated);
        }
        let mut addresses = Vec::new();
        let mut host_address = None;
        let mut bpos = pos;
        let mut first = true;
        while bpos < block_end {
            let (addr, n) = Address::decode(&buf[bpos..block_end])?;
            if first && addr.kind == crate::address::AddressKind::Redirection {
                host_address = Some(addr);
            } else {
                addresses.push(addr);
            }
            first = false;
            bpos += n;
        }
        if buf[block_end] != REPORTED_PEER_END {
            return Err(ProtoError::UnknownSignature);
        }
        Ok((
            Self {
                peer_id,
                time_since_last_report_secs: time_since,
                host_address,
                addresses,
            },
            block_end + 1,
        ))
    }
}

/// `GROUP_REPORT` payload (§4.8.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    /// The address we believe the receiver is reachable at.
    pub receiver_address: Address,
    /// Our own host (rendezvous-style) address.
    pub host_address: Address,
    /// Peers from our best list we are advertising.
    pub peers: Vec<ReportedPeer>,
}

const GROUP_REPORT_ZERO_TERM: u8 = 0x00;

impl GroupReport {
    /// Encode this message's body (without the leading `GROUP_REPORT`
    /// opcode, per the §4.8 table's convention of opcode-prefixed payloads).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.receiver_address.encode(&mut out);
        self.host_address.encode(&mut out);
        out.push(GROUP_REPORT_ZERO_TERM);
        for peer in &self.peers {
            peer.encode(&mut out);
        }
        out
    }

    /// Decode this message's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (receiver_address, n) = Address::decode(buf)?;
        let mut pos = n;
        let (host_address, n) = Address::decode(&buf[pos..])?;
        pos += n;
        if *buf.get(pos).ok_or(ProtoError::Truncated)? != GROUP_REPORT_ZERO_TERM {
            return Err(ProtoError::UnknownSignature);
        }
        pos += 1;
        let mut peers = Vec::new();
        while pos < buf.len() {
            let (peer, n) = ReportedPeer::decode(&buf[pos..])?;
            peers.push(peer);
            pos += n;
        }
        Ok(Self {
            receiver_address,
            host_address,
            peers,
        })
    }
}

/// A single byte-sized opaque message body, used for opcodes with no
/// payload (`ABORT`, `ASK_CLOSE`, `BEGIN`, `BEGIN_NEAREST`).
pub type EmptyBody = Bytes;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(octet: u8, kind: crate::address::AddressKind) -> Address {
        Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, octet)), 1935),
            kind,
        )
    }

    #[test]
    fn group_init_round_trips() {
        let msg = GroupInit {
            group_id_hex: "a".repeat(64),
            key: [5u8; 32],
            peer_id: PeerId::from_public_key(b"x"),
        };
        let decoded = GroupInit::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn media_info_round_trips() {
        let msg = MediaInfo {
            stream_name: "camera1".to_string(),
            stream_key: new_stream_key([1u8; 32]),
            config: GroupConfigTlvs {
                window_duration_ms: 8000,
                availability_update_period_ms: 100,
                availability_send_to_all: true,
                fetch_period_ms: 2500,
            },
        };
        let decoded = MediaInfo::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn fragments_map_bit_layout_is_lsb_of_oldest() {
        // lastId=10, we hold 9 and 7 (distances 0 and 2 from lastId-1=9).
        let map = FragmentsMap::build(10, &[9, 7], 16);
        assert!(map.has(9));
        assert!(map.has(7));
        assert!(!map.has(8));
        assert!(!map.has(6));
        // bit 0 of byte 0 = distance 0 = id 9; bit 2 of byte 0 = distance 2 = id 7.
        assert_eq!(map.bitmap[0] & 0x01, 0x01);
        assert_eq!(map.bitmap[0] & 0x04, 0x04);
    }

    #[test]
    fn fragments_map_round_trips() {
        let map = FragmentsMap::build(100, &(50..100).collect::<Vec<_>>(), 64);
        let decoded = FragmentsMap::decode(&map.encode()).unwrap();
        assert_eq!(decoded, map);
        for id in 50..100 {
            assert!(decoded.has(id));
        }
    }

    #[test]
    fn play_push_and_pull_round_trip() {
        let push = PlayPush { mode: 0x01 };
        assert_eq!(PlayPush::decode(&push.encode()).unwrap(), push);
        let pull = PlayPull { id: 12345 };
        assert_eq!(PlayPull::decode(&pull.encode()).unwrap(), pull);
    }

    #[test]
    fn group_report_round_trips_with_peers() {
        let report = GroupReport {
            receiver_address: addr(2, crate::address::AddressKind::Public),
            host_address: addr(1, crate::address::AddressKind::Redirection),
            peers: vec![ReportedPeer {
                peer_id: PeerId::from_public_key(b"p1"),
                time_since_last_report_secs: 30,
                host_address: Some(addr(1, crate::address::AddressKind::Redirection)),
                addresses: vec![addr(5, crate::address::AddressKind::Local)],
            }],
        };
        let decoded = GroupReport::decode(&report.encode()).unwrap();
        assert_eq!(decoded, report);
    }
}
