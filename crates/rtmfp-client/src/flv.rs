// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! FLV container framing on `read()` (§6 "FLV framing on read").

use rtmfp_proto::AmfType;

/// The 13-byte FLV file header: signature, version, audio+video flags,
/// header size, and a zeroed first `PreviousTagSize0`.
pub const FLV_HEADER: [u8; 13] = [
    0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// FLV tag type byte for a given AMF payload type; `None` for types with no
/// FLV tag representation (raw/data/invocation carry no media tag).
#[must_use]
fn tag_type(amf_type: AmfType) -> Option<u8> {
    match amf_type {
        AmfType::Audio => Some(0x08),
        AmfType::Video => Some(0x09),
        AmfType::Data | AmfType::DataAmf3 => Some(0x12),
        AmfType::Invocation | AmfType::InvocationAmf3 | AmfType::Raw => None,
    }
}

/// Frame one delivered message as an FLV tag: `tagType(8) || size(24) ||
/// timestamp(24) || timestampExt(8) || streamId(24=0) || payload ||
/// prevTagSize(32)`.
///
/// Returns `false` (writing nothing) if `amf_type` has no FLV tag
/// representation.
#[must_use]
pub fn encode_tag(amf_type: AmfType, timestamp: u32, payload: &[u8], out: &mut Vec<u8>) -> bool {
    let Some(ty) = tag_type(amf_type) else {
        return false;
    };
    out.push(ty);
    let size = payload.len();
    out.extend_from_slice(&size.to_be_bytes()[5..8]);
    out.extend_from_slice(&timestamp.to_be_bytes()[1..4]);
    out.push((timestamp >> 24) as u8);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(payload);
    #[allow(clippy::cast_possible_truncation)]
    let prev_tag_size = (11 + size) as u32;
    out.extend_from_slice(&prev_tag_size.to_be_bytes());
    true
}

/// One decoded FLV tag: its AMF type, timestamp, payload slice (borrowed
/// from `buf`), and total bytes consumed including `PreviousTagSize`.
pub struct DecodedTag<'a> {
    /// AMF payload type implied by the tag's `tagType` byte.
    pub amf_type: AmfType,
    /// Reassembled 32-bit timestamp (`timestamp` || `timestampExt`).
    pub timestamp: u32,
    /// The tag's payload bytes.
    pub payload: &'a [u8],
    /// Total bytes consumed from `buf`, including the trailing
    /// `PreviousTagSize` field.
    pub consumed: usize,
}

const TAG_HEADER_LEN: usize = 11;
const PREV_TAG_SIZE_LEN: usize = 4;

/// Parse one FLV tag from the front of `buf`, skipping a leading
/// [`FLV_HEADER`] if present. Returns `None` if `buf` doesn't hold a
/// complete tag yet (the caller should buffer and retry once more bytes
/// arrive) or if the tag type isn't one this crate frames.
#[must_use]
pub fn decode_tag(buf: &[u8]) -> Option<DecodedTag<'_>> {
    let header_skip = if buf.starts_with(&FLV_HEADER[..]) { FLV_HEADER.len() } else { 0 };
    let rest = &buf[header_skip..];
    if rest.len() < TAG_HEADER_LEN {
        return None;
    }
    let amf_type = match rest[0] {
        0x08 => AmfType::Audio,
        0x09 => AmfType::Video,
        0x12 => AmfType::Data,
        _ => return None,
    };
    let size = (usize::from(rest[1]) << 16) | (usize::from(rest[2]) << 8) | usize::from(rest[3]);
    let ts_low = (u32::from(rest[4]) << 16) | (u32::from(rest[5]) << 8) | u32::from(rest[6]);
    let timestamp = (u32::from(rest[7]) << 24) | ts_low;
    let tag_total = TAG_HEADER_LEN + size + PREV_TAG_SIZE_LEN;
    if rest.len() < tag_total {
        return None;
    }
    let payload = &rest[TAG_HEADER_LEN..TAG_HEADER_LEN + size];
    Some(DecodedTag { amf_type, timestamp, payload, consumed: header_skip + tag_total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_the_literal_bytes() {
        assert_eq!(
            FLV_HEADER,
            [0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn video_tag_frames_size_and_prev_tag_size() {
        let mut out = Vec::new();
        let written = encode_tag(AmfType::Video, 0x0102_0304, b"frame", &mut out);
        assert!(written);
        assert_eq!(out[0], 0x09);
        assert_eq!(&out[1..4], &[0, 0, 5]);
        assert_eq!(&out[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(out[7], 0x01);
        assert_eq!(&out[8..11], &[0, 0, 0]);
        assert_eq!(&out[11..16], b"frame");
        let prev_tag_size = u32::from_be_bytes(out[16..20].try_into().unwrap());
        assert_eq!(prev_tag_size, 16);
    }

    #[test]
    fn invocation_has_no_flv_tag() {
        let mut out = Vec::new();
        let written = encode_tag(AmfType::Invocation, 0, b"call", &mut out);
        assert!(!written);
        assert!(out.is_empty());
    }

    #[test]
    fn decode_tag_skips_a_leading_file_header() {
        let mut buf = FLV_HEADER.to_vec();
        encode_tag(AmfType::Audio, 7, b"pcm", &mut buf);
        let tag = decode_tag(&buf).unwrap();
        assert_eq!(tag.amf_type, AmfType::Audio);
        assert_eq!(tag.timestamp, 7);
        assert_eq!(tag.payload, b"pcm");
        assert_eq!(tag.consumed, buf.len());
    }

    #[test]
    fn decode_tag_returns_none_on_a_truncated_tag() {
        let mut buf = Vec::new();
        encode_tag(AmfType::Video, 0, b"frame", &mut buf);
        assert!(decode_tag(&buf[..buf.len() - 1]).is_none());
    }
}
