// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flow/writer fragment framing (§3 "Fragment", §4.4, §4.5) and NetGroup
//! media fragment framing (§3 "GroupFragment", §4.9.2).

use bytes::Bytes;

use crate::error::ProtoError;
use crate::message::AmfType;
use crate::varint::{read_u32, read_u64, write_u32, write_u64};

bitflags::bitflags! {
    /// Fragment flag byte (§3 "Fragment"). Named per spec, not after the
    /// mechanical bit position.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FragmentFlags: u8 {
        /// Fragment carries the flow header (`flowId`, `stage`, `deltaNAck`,
        /// optional options block).
        const HEADER = 0x01;
        /// An `OPTIONS` block follows the header fields.
        const OPTIONS = 0x02;
        /// This fragment continues a message whose earlier part was already sent.
        const WITH_BEFOREPART = 0x10;
        /// Another fragment of this message follows.
        const WITH_AFTERPART = 0x20;
        /// Discard the in-progress message this fragment would otherwise continue.
        const ABANDON = 0x40;
        /// This is the writer's final fragment; the flow completes once delivered.
        const END = 0x80;
    }
}

/// One wire fragment of a flow/writer message (§3, §4.4).
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Per-writer sequence number.
    pub stage: u32,
    /// Flag byte (see [`FragmentFlags`]).
    pub flags: FragmentFlags,
    /// Fragment payload bytes.
    pub bytes: Bytes,
}

impl Fragment {
    /// Whether this fragment, alone, both begins and ends a message (no
    /// `BEFOREPART`/`AFTERPART` set).
    #[must_use]
    pub fn is_whole_message(&self) -> bool {
        !self.flags.contains(FragmentFlags::WITH_BEFOREPART)
            && !self.flags.contains(FragmentFlags::WITH_AFTERPART)
    }

    /// Whether this fragment begins a new (possibly multi-fragment) message.
    #[must_use]
    pub fn begins_message(&self) -> bool {
        !self.flags.contains(FragmentFlags::WITH_BEFOREPART)
    }

    /// Whether this fragment completes the message it participates in.
    #[must_use]
    pub fn completes_message(&self) -> bool {
        !self.flags.contains(FragmentFlags::WITH_AFTERPART)
    }
}

/// Marker distinguishing the role of a [`GroupFragment`] within the media
/// split-fragment sequence (§3, §4.9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMarker {
    /// A complete, unsplit fragment (`MEDIA_DATA`).
    Data,
    /// The first piece of a split fragment (`MEDIA_START`).
    Start,
    /// A middle piece of a split fragment (`MEDIA_NEXT`).
    Next,
    /// The final piece of a split fragment, or end-of-stream (`MEDIA_END`).
    End,
}

/// A NetGroup media fragment (§3 "GroupFragment").
#[derive(Debug, Clone)]
pub struct GroupFragment {
    /// Publisher-assigned monotonic 64-bit sequence number.
    pub id: u64,
    /// Split-sequence role.
    pub marker: GroupMarker,
    /// Remaining split pieces after this one (0 for [`GroupMarker::Data`]
    /// and the terminal [`GroupMarker::End`] piece).
    pub split_remaining: u8,
    /// AMF media type of the fragment's first piece (`Audio`/`Video`).
    pub media_type: Option<crate::message::AmfType>,
    /// Timestamp of the fragment's first piece.
    pub timestamp: Option<u32>,
    /// Payload bytes for this piece.
    pub bytes: Bytes,
}

impl GroupFragment {
    /// Whether this fragment is part of a split sequence (not a standalone
    /// `MEDIA_DATA`).
    #[must_use]
    pub fn is_split(&self) -> bool {
        !matches!(self.marker, GroupMarker::Data)
    }

    /// Encode the wire form of this piece, opcode byte included (§4.9.2):
    /// `MEDIA_DATA = id || mediaType || timestamp(32) || payload`;
    /// `MEDIA_START = id || splitRemaining || mediaType || timestamp(32) ||
    /// payload`; `MEDIA_NEXT = id || splitRemaining || payload`; `MEDIA_END
    /// = id || payload`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + 16);
        out.push(self.marker.opcode());
        write_u64(&mut out, self.id);
        match self.marker {
            GroupMarker::Data => {
                out.push(self.media_type.map_or(0, AmfType::tag));
                write_u32(&mut out, self.timestamp.unwrap_or(0));
            }
            GroupMarker::Start => {
                out.push(self.split_remaining);
                out.push(self.media_type.map_or(0, AmfType::tag));
                write_u32(&mut out, self.timestamp.unwrap_or(0));
            }
            GroupMarker::Next => {
                out.push(self.split_remaining);
            }
            GroupMarker::End => {}
        }
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Decode one piece from its opcode-prefixed wire form.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let opcode = *buf.first().ok_or(ProtoError::Truncated)?;
        let marker = GroupMarker::from_opcode(opcode)?;
        let mut pos = 1;
        let (id, n) = read_u64(&buf[pos..])?;
        pos += n;
        let mut split_remaining = 0u8;
        let mut media_type = None;
        let mut timestamp = None;
        match marker {
            GroupMarker::Data => {
                let tag = *buf.get(pos).ok_or(ProtoError::Truncated)?;
                pos += 1;
                media_type = Some(AmfType::from_tag(tag)?);
                let (ts, n) = read_u32(&buf[pos..])?;
                timestamp = Some(ts);
                pos += n;
            }
            GroupMarker::Start => {
                split_remaining = *buf.get(pos).ok_or(ProtoError::Truncated)?;
                pos += 1;
                let tag = *buf.get(pos).ok_or(ProtoError::Truncated)?;
                pos += 1;
                media_type = Some(AmfType::from_tag(tag)?);
                let (ts, n) = read_u32(&buf[pos..])?;
                timestamp = Some(ts);
                pos += n;
            }
            GroupMarker::Next => {
                split_remaining = *buf.get(pos).ok_or(ProtoError::Truncated)?;
                pos += 1;
            }
            GroupMarker::End => {}
        }
        Ok(Self {
            id,
            marker,
            split_remaining,
            media_type,
            timestamp,
            bytes: Bytes::copy_from_slice(&buf[pos..]),
        })
    }
}

/// Opcode bytes for the Group media-fragment opcodes (§4.8 table, §4.9.2).
pub mod opcode {
    /// `MEDIA_NEXT`.
    pub const MEDIA_NEXT: u8 = 0x10;
    /// `MEDIA_DATA`.
    pub const MEDIA_DATA: u8 = 0x20;
    /// `MEDIA_START`.
    pub const MEDIA_START: u8 = 0x30;
    /// `MEDIA_END`.
    pub const MEDIA_END: u8 = 0x00;
}

impl GroupMarker {
    /// Wire opcode for this marker.
    #[must_use]
    pub const fn opcode(self) -> u8 {
        match self {
            GroupMarker::Data => opcode::MEDIA_DATA,
            GroupMarker::Start => opcode::MEDIA_START,
            GroupMarker::Next => opcode::MEDIA_NEXT,
            GroupMarker::End => opcode::MEDIA_END,
        }
    }

    /// Decode a wire opcode into a marker.
    pub fn from_opcode(op: u8) -> Result<Self, ProtoError> {
        Ok(match op {
            opcode::MEDIA_DATA => GroupMarker::Data,
            opcode::MEDIA_START => GroupMarker::Start,
            opcode::MEDIA_NEXT => GroupMarker::Next,
            opcode::MEDIA_END => GroupMarker::End,
            other => return Err(ProtoError::UnknownChunk(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_message_fragment_has_neither_part_flag() {
        let f = Fragment {
            stage: 1,
            flags: FragmentFlags::HEADER,
            bytes: Bytes::from_static(b"x"),
        };
        assert!(f.is_whole_message());
        assert!(f.begins_message());
        assert!(f.completes_message());
    }

    #[test]
    fn middle_fragment_neither_begins_nor_completes() {
        let f = Fragment {
            stage: 2,
            flags: FragmentFlags::WITH_BEFOREPART | FragmentFlags::WITH_AFTERPART,
            bytes: Bytes::from_static(b"x"),
        };
        assert!(!f.begins_message());
        assert!(!f.completes_message());
    }

    #[test]
    fn group_fragment_data_round_trips() {
        let f = GroupFragment {
            id: 42,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(1234),
            bytes: Bytes::from_static(b"frame"),
        };
        let decoded = GroupFragment::decode(&f.encode()).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.marker, GroupMarker::Data);
        assert_eq!(decoded.media_type, Some(AmfType::Video));
        assert_eq!(decoded.timestamp, Some(1234));
        assert_eq!(&decoded.bytes[..], b"frame");
    }

    #[test]
    fn group_fragment_split_sequence_round_trips() {
        let start = GroupFragment {
            id: 7,
            marker: GroupMarker::Start,
            split_remaining: 2,
            media_type: Some(AmfType::Video),
            timestamp: Some(10),
            bytes: Bytes::from_static(b"aaa"),
        };
        let next = GroupFragment {
            id: 7,
            marker: GroupMarker::Next,
            split_remaining: 1,
            media_type: None,
            timestamp: None,
            bytes: Bytes::from_static(b"bbb"),
        };
        let end = GroupFragment {
            id: 7,
            marker: GroupMarker::End,
            split_remaining: 0,
            media_type: None,
            timestamp: None,
            bytes: Bytes::from_static(b"ccc"),
        };
        let d_start = GroupFragment::decode(&start.encode()).unwrap();
        assert_eq!(d_start.split_remaining, 2);
        assert_eq!(d_start.media_type, Some(AmfType::Video));
        let d_next = GroupFragment::decode(&next.encode()).unwrap();
        assert_eq!(d_next.split_remaining, 1);
        assert_eq!(&d_next.bytes[..], b"bbb");
        let d_end = GroupFragment::decode(&end.encode()).unwrap();
        assert_eq!(d_end.marker, GroupMarker::End);
        assert_eq!(&d_end.bytes[..], b"ccc");
    }

    #[test]
    fn group_marker_opcode_round_trips() {
        for m in [
            GroupMarker::Data,
            GroupMarker::Start,
            GroupMarker::Next,
            GroupMarker::End,
        ] {
            assert_eq!(GroupMarker::from_opcode(m.opcode()).unwrap(), m);
        }
    }
}
