// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The small AMF type tag and timestamp prefix carried by every flow/writer
//! message (§3 "Message"). AMF payload *decoding* is out of scope (§1); this
//! module only frames the opaque byte slice the Flash-command boundary will
//! later interpret.

use bytes::Bytes;

use crate::error::ProtoError;

/// Closed tag set for the AMF payload type carried in a [`Message`] (§1, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmfType {
    /// `TYPE_AUDIO`.
    Audio,
    /// `TYPE_VIDEO`.
    Video,
    /// `TYPE_DATA` (AMF0).
    Data,
    /// `TYPE_INVOCATION` (AMF0 command).
    Invocation,
    /// AMF3-encoded data message.
    DataAmf3,
    /// AMF3-encoded invocation.
    InvocationAmf3,
    /// Opaque bytes with no AMF framing at all.
    Raw,
}

impl AmfType {
    /// Wire tag byte for this type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            AmfType::Audio => 0x08,
            AmfType::Video => 0x09,
            AmfType::Data => 0x12,
            AmfType::Invocation => 0x14,
            AmfType::DataAmf3 => 0x0F,
            AmfType::InvocationAmf3 => 0x11,
            AmfType::Raw => 0x00,
        }
    }

    /// Decode a wire tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, ProtoError> {
        Ok(match tag {
            0x08 => AmfType::Audio,
            0x09 => AmfType::Video,
            0x12 => AmfType::Data,
            0x14 => AmfType::Invocation,
            0x0F => AmfType::DataAmf3,
            0x11 => AmfType::InvocationAmf3,
            0x00 => AmfType::Raw,
            other => return Err(ProtoError::UnknownChunk(other)),
        })
    }

    /// Whether messages of this type carry the 32-bit media timestamp
    /// prefix (§3: "32-bit timestamp for media types").
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, AmfType::Audio | AmfType::Video)
    }
}

/// Reliability class of a [`Message`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Delivered in order; retransmitted on loss until acked.
    Reliable,
    /// Delivered in order but may be silently dropped on loss.
    Unreliable,
}

/// A framed flow/writer payload: AMF type tag, optional media timestamp, and
/// the opaque body bytes.
#[derive(Debug, Clone)]
pub struct Message {
    /// AMF payload type.
    pub amf_type: AmfType,
    /// Timestamp in milliseconds, present only for [`AmfType::is_media`] types.
    pub timestamp: Option<u32>,
    /// Reliability class.
    pub reliability: Reliability,
    /// Opaque payload bytes (refcounted, O(1) to slice for fragmentation).
    pub body: Bytes,
}

impl Message {
    /// Build a new message.
    #[must_use]
    pub fn new(
        amf_type: AmfType,
        timestamp: Option<u32>,
        reliability: Reliability,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            amf_type,
            timestamp: if amf_type.is_media() { timestamp } else { None },
            reliability,
            body: body.into(),
        }
    }

    /// Encoded prefix length: 1 tag byte, plus 4 timestamp bytes for media
    /// types.
    #[must_use]
    pub fn prefix_len(&self) -> usize {
        1 + if self.amf_type.is_media() { 4 } else { 0 }
    }

    /// Serialize the tag/timestamp prefix (not the body) into `out`.
    pub fn encode_prefix(&self, out: &mut Vec<u8>) {
        out.push(self.amf_type.tag());
        if self.amf_type.is_media() {
            out.extend_from_slice(&self.timestamp.unwrap_or(0).to_be_bytes());
        }
    }

    /// Parse the tag/timestamp prefix from the front of `buf`, returning the
    /// parsed fields (minus reliability and body, which the caller supplies
    /// from flow/fragment context) and bytes consumed.
    pub fn decode_prefix(buf: &[u8]) -> Result<(AmfType, Option<u32>, usize), ProtoError> {
        let tag = *buf.first().ok_or(ProtoError::Truncated)?;
        let amf_type = AmfType::from_tag(tag)?;
        if amf_type.is_media() {
            if buf.len() < 5 {
                return Err(ProtoError::Truncated);
            }
            let ts = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            Ok((amf_type, Some(ts), 5))
        } else {
            Ok((amf_type, None, 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_messages_round_trip_timestamp() {
        let msg = Message::new(AmfType::Video, Some(1000), Reliability::Reliable, &b"frame"[..]);
        let mut out = Vec::new();
        msg.encode_prefix(&mut out);
        let (ty, ts, consumed) = Message::decode_prefix(&out).unwrap();
        assert_eq!(ty, AmfType::Video);
        assert_eq!(ts, Some(1000));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn non_media_messages_have_no_timestamp() {
        let msg = Message::new(AmfType::Invocation, None, Reliability::Reliable, &b"call"[..]);
        let mut out = Vec::new();
        msg.encode_prefix(&mut out);
        assert_eq!(out.len(), 1);
        let (ty, ts, consumed) = Message::decode_prefix(&out).unwrap();
        assert_eq!(ty, AmfType::Invocation);
        assert_eq!(ts, None);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn timestamp_is_ignored_for_non_media_constructor_input() {
        let msg = Message::new(AmfType::Data, Some(99), Reliability::Unreliable, &b""[..]);
        assert_eq!(msg.timestamp, None);
    }
}
