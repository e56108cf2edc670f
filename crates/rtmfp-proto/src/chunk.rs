// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session chunk framing and the common (non-handshake, non-group) chunk
//! bodies: flow header/continuation (§4.4), cumulative+selective ack
//! (§4.4 "ACK policy"), flow exception, keepalive, and close (§4.10).
//!
//! Every packet body is a stream of self-delimited chunks: `type(8) ||
//! length(16, big-endian) || payload(length)`. A `Session` reads chunks one
//! at a time off this stream and dispatches on `type`.

use bytes::Bytes;

use crate::error::ProtoError;
use crate::fragment::FragmentFlags;
use crate::varint::{read_u32, write_u32};

/// Chunk type bytes dispatched by the common session layer (§4.4, §4.10).
pub mod chunk_type {
    /// Flow data with header (`flags`, `flowId`, `stage`, `deltaNAck`, options).
    pub const FLOW_HEADER: u8 = 0x10;
    /// Flow data continuation, no header.
    pub const FLOW_CONTINUATION: u8 = 0x11;
    /// Cumulative + selective ack.
    pub const ACK: u8 = 0x51;
    /// Flow exception.
    pub const FLOW_EXCEPTION: u8 = 0x5E;
    /// Keepalive request.
    pub const KEEPALIVE: u8 = 0x01;
    /// Keepalive acknowledgement.
    pub const KEEPALIVE_ACK: u8 = 0x41;
    /// Session close request.
    pub const CLOSE: u8 = 0x0C;
    /// Session close acknowledgement.
    pub const CLOSE_ACK: u8 = 0x4C;
}

/// The receive buffer advertisement value meaning "idle / fully open"
/// (§4.4 "ACK policy").
pub const RECEIVE_BUFFER_IDLE: u32 = 0x7F;

/// Append one self-delimited chunk (`type || len(16) || body`) to `out`.
pub fn write_chunk(out: &mut Vec<u8>, chunk_type: u8, body: &[u8]) {
    out.push(chunk_type);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// Read one self-delimited chunk from the front of `buf`.
///
/// Returns `(chunk_type, body, total_bytes_consumed)`.
pub fn read_chunk(buf: &[u8]) -> Result<(u8, &[u8], usize), ProtoError> {
    if buf.len() < 3 {
        return Err(ProtoError::Truncated);
    }
    let chunk_type = buf[0];
    let len = usize::from(u16::from_be_bytes([buf[1], buf[2]]));
    if buf.len() < 3 + len {
        return Err(ProtoError::LengthOverrun {
            declared: len,
            remaining: buf.len() - 3,
        });
    }
    Ok((chunk_type, &buf[3..3 + len], 3 + len))
}

/// A fully parsed `0x0A`-style writer back-reference option ("fullduplex"),
/// plus the flow signature every `OPTIONS` block begins with (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOptions {
    /// Identifies the flow's purpose (NetGroup writer signature, NetStream
    /// signature, …); dispatch key for which handler owns this flow.
    pub signature: Bytes,
    /// Back-reference to the remote writer id this flow answers, when the
    /// peer declares full-duplex pairing.
    pub writer_ref: Option<u16>,
}

const OPTION_WRITER_REF: u8 = 0x0A;
const OPTION_END: u8 = 0xFF;

impl FlowOptions {
    fn encode(&self, out: &mut Vec<u8>) {
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&self.signature);
        if let Some(writer_id) = self.writer_ref {
            out.push(OPTION_WRITER_REF);
            out.push(2);
            out.extend_from_slice(&writer_id.to_be_bytes());
        }
        out.push(OPTION_END);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        let sig_len = usize::from(*buf.first().ok_or(ProtoError::Truncated)?);
        if buf.len() < 1 + sig_len {
            return Err(ProtoError::Truncated);
        }
        let signature = Bytes::copy_from_slice(&buf[1..1 + sig_len]);
        let mut pos = 1 + sig_len;
        let mut writer_ref = None;
        loop {
            let id = *buf.get(pos).ok_or(ProtoError::Truncated)?;
            pos += 1;
            if id == OPTION_END {
                break;
            }
            let len = usize::from(*buf.get(pos).ok_or(ProtoError::Truncated)?);
            pos += 1;
            if buf.len() < pos + len {
                return Err(ProtoError::Truncated);
            }
            if id == OPTION_WRITER_REF && len == 2 {
                writer_ref = Some(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
            }
            pos += len;
        }
        Ok((
            Self {
                signature,
                writer_ref,
            },
            pos,
        ))
    }
}

/// Body of a `0x10`/`0x11` flow-data chunk (§4.4).
#[derive(Debug, Clone)]
pub struct FlowData {
    /// Fragment flags (see [`FragmentFlags`]).
    pub flags: FragmentFlags,
    /// Target flow id. Present only on `FLOW_HEADER` chunks; continuation
    /// chunks reuse the most recently seen flow id on this session.
    pub flow_id: Option<u64>,
    /// Writer-assigned stage for this fragment. `None` on continuations,
    /// which are always `stage + 1` of the prior fragment on the same flow.
    pub stage: Option<u32>,
    /// Sender's `stage - stageSent` at emission time, used by the receiver
    /// to decide how much out-of-order slack to tolerate (§4.4).
    pub delta_nack: Option<u32>,
    /// `OPTIONS` block, present only when `flags & OPTIONS` and this is a
    /// header chunk.
    pub options: Option<FlowOptions>,
    /// Fragment payload.
    pub payload: Bytes,
}

impl FlowData {
    /// Encode as a `FLOW_HEADER` chunk body (always carries flow id/stage/
    /// delta and, optionally, the options block).
    pub fn encode_header(
        flags: FragmentFlags,
        flow_id: u64,
        stage: u32,
        delta_nack: u32,
        options: Option<&FlowOptions>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut flags = flags;
        if options.is_some() {
            flags.insert(FragmentFlags::OPTIONS);
        }
        let mut out = vec![flags.bits()];
        write_u32(&mut out, u32::try_from(flow_id).unwrap_or(u32::MAX));
        write_u32(&mut out, stage.wrapping_sub(1));
        write_u32(&mut out, delta_nack.wrapping_sub(1));
        if let Some(opts) = options {
            opts.encode(&mut out);
        }
        out.extend_from_slice(payload);
        out
    }

    /// Encode as a `FLOW_CONTINUATION` chunk body (flags + payload only).
    pub fn encode_continuation(flags: FragmentFlags, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![flags.bits()];
        out.extend_from_slice(payload);
        out
    }

    /// Decode a chunk body, given whether it was read as `FLOW_HEADER` or
    /// `FLOW_CONTINUATION`.
    pub fn decode(buf: &[u8], is_header: bool) -> Result<Self, ProtoError> {
        let raw_flags = *buf.first().ok_or(ProtoError::Truncated)?;
        let flags = FragmentFlags::from_bits_truncate(raw_flags);
        let mut pos = 1;
        if !is_header {
            return Ok(Self {
                flags,
                flow_id: None,
                stage: None,
                delta_nack: None,
                options: None,
                payload: Bytes::copy_from_slice(&buf[pos..]),
            });
        }
        let (flow_id, n) = read_u32(&buf[pos..])?;
        pos += n;
        let (stage_m1, n) = read_u32(&buf[pos..])?;
        pos += n;
        let (delta_m1, n) = read_u32(&buf[pos..])?;
        pos += n;
        let options = if flags.contains(FragmentFlags::OPTIONS) {
            let (opts, n) = FlowOptions::decode(&buf[pos..])?;
            pos += n;
            Some(opts)
        } else {
            None
        };
        Ok(Self {
            flags,
            flow_id: Some(u64::from(flow_id)),
            stage: Some(stage_m1.wrapping_add(1)),
            delta_nack: Some(delta_m1.wrapping_add(1)),
            options,
            payload: Bytes::copy_from_slice(&buf[pos..]),
        })
    }
}

/// One `(gap, run)` pair in a selective-ack's loss description (§4.4).
///
/// `gap` is the distance from the prior contiguous point to the start of
/// this buffered-but-non-contiguous run; `run` is how many additional
/// consecutive stages (beyond the first) are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRun {
    /// Stages skipped before this run begins.
    pub gap: u32,
    /// Extra consecutive stages present in this run (0 = a single stage).
    pub run: u32,
}

/// Body of a `0x51` cumulative + selective ack chunk (§4.4 "ACK policy").
#[derive(Debug, Clone)]
pub struct Ack {
    /// Flow id this ack applies to.
    pub flow_id: u64,
    /// Advertised receive buffer slack ([`RECEIVE_BUFFER_IDLE`] when idle).
    pub receive_buffer: u32,
    /// Highest contiguously received stage.
    pub stage_ack: u32,
    /// Non-contiguous buffered ranges beyond `stage_ack`.
    pub runs: Vec<AckRun>,
}

impl Ack {
    /// Encode this ack's chunk body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, u32::try_from(self.flow_id).unwrap_or(u32::MAX));
        write_u32(&mut out, self.receive_buffer);
        write_u32(&mut out, self.stage_ack);
        for run in &self.runs {
            write_u32(&mut out, run.gap);
            write_u32(&mut out, run.run);
        }
        out
    }

    /// Decode an ack chunk body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut pos = 0;
        let (flow_id, n) = read_u32(&buf[pos..])?;
        pos += n;
        let (receive_buffer, n) = read_u32(&buf[pos..])?;
        pos += n;
        let (stage_ack, n) = read_u32(&buf[pos..])?;
        pos += n;
        let mut runs = Vec::new();
        while pos < buf.len() {
            let (gap, n) = read_u32(&buf[pos..])?;
            pos += n;
            let (run, n) = read_u32(&buf[pos..])?;
            pos += n;
            runs.push(AckRun { gap, run });
        }
        Ok(Self {
            flow_id: u64::from(flow_id),
            receive_buffer,
            stage_ack,
            runs,
        })
    }
}

/// Body of a `0x5E` flow exception chunk: `flowId || 0x00`.
#[must_use]
pub fn encode_flow_exception(flow_id: u64) -> Vec<u8> {
    let mut out = Vec::new();
    write_u32(&mut out, u32::try_from(flow_id).unwrap_or(u32::MAX));
    out.push(0);
    out
}

/// Decode a `0x5E` flow exception chunk body, returning the flow id.
pub fn decode_flow_exception(buf: &[u8]) -> Result<u64, ProtoError> {
    let (flow_id, _) = read_u32(buf)?;
    Ok(u64::from(flow_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trips() {
        let mut out = Vec::new();
        write_chunk(&mut out, chunk_type::ACK, b"body-bytes");
        let (ty, body, consumed) = read_chunk(&out).unwrap();
        assert_eq!(ty, chunk_type::ACK);
        assert_eq!(body, b"body-bytes");
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn flow_header_round_trips_with_options() {
        let opts = FlowOptions {
            signature: Bytes::from_static(b"\x00\x47\x52\x1C"),
            writer_ref: Some(7),
        };
        let body = FlowData::encode_header(
            FragmentFlags::HEADER,
            5,
            1,
            1,
            Some(&opts),
            b"payload",
        );
        let decoded = FlowData::decode(&body, true).unwrap();
        assert_eq!(decoded.flow_id, Some(5));
        assert_eq!(decoded.stage, Some(1));
        assert_eq!(decoded.delta_nack, Some(1));
        assert_eq!(decoded.options, Some(opts));
        assert_eq!(decoded.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn flow_header_round_trips_without_options() {
        let body = FlowData::encode_header(FragmentFlags::HEADER, 2, 10, 0, None, b"x");
        let decoded = FlowData::decode(&body, true).unwrap();
        assert_eq!(decoded.flow_id, Some(2));
        assert_eq!(decoded.stage, Some(10));
        assert!(decoded.options.is_none());
    }

    #[test]
    fn continuation_has_no_header_fields() {
        let body = FlowData::encode_continuation(FragmentFlags::empty(), b"y");
        let decoded = FlowData::decode(&body, false).unwrap();
        assert!(decoded.flow_id.is_none());
        assert_eq!(decoded.payload, Bytes::from_static(b"y"));
    }

    #[test]
    fn ack_round_trips_with_runs() {
        let ack = Ack {
            flow_id: 3,
            receive_buffer: RECEIVE_BUFFER_IDLE,
            stage_ack: 3,
            runs: vec![AckRun { gap: 1, run: 0 }],
        };
        let encoded = ack.encode();
        let decoded = Ack::decode(&encoded).unwrap();
        assert_eq!(decoded.flow_id, 3);
        assert_eq!(decoded.stage_ack, 3);
        assert_eq!(decoded.runs, vec![AckRun { gap: 1, run: 0 }]);
    }

    #[test]
    fn flow_exception_round_trips() {
        let body = encode_flow_exception(42);
        assert_eq!(decode_flow_exception(&body).unwrap(), 42);
    }
}
