// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer identity (§3 "PeerId").
//!
//! `PeerId` is `SHA-256` of the canonical form of a peer's DH public key.
//! On the wire it is always carried prefixed with `rawId = 0x21 0x0F ||
//! peerId`; §4.8's `rawPeerId(34)` fields are exactly this `RawPeerId`.

use std::fmt;

use rtmfp_crypto::sha256;

use crate::error::ProtoError;

/// Prefix bytes that precede a bare [`PeerId`] whenever the wire carries a
/// "raw" (length-tagged) peer id, per §3 and §4.8.
pub const RAW_PEER_ID_PREFIX: [u8; 2] = [0x21, 0x0F];

/// 32-byte peer identity: `SHA-256(canonical public key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive a peer id from the canonical encoding of a DH public key.
    #[must_use]
    pub fn from_public_key(canonical_public_key: &[u8]) -> Self {
        Self(sha256(canonical_public_key))
    }

    /// Build directly from 32 raw bytes (e.g. decoded off the wire).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64-character lowercase hex display form (§3).
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Encode as the 34-byte `rawId = 0x21 0x0F || peerId` wire form.
    pub fn encode_raw(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&RAW_PEER_ID_PREFIX);
        out.extend_from_slice(&self.0);
    }

    /// Decode a 34-byte `rawId` from the front of `buf`.
    pub fn decode_raw(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        if buf.len() < 34 {
            return Err(ProtoError::Truncated);
        }
        if buf[0..2] != RAW_PEER_ID_PREFIX {
            return Err(ProtoError::UnknownSignature);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&buf[2..34]);
        Ok((Self(bytes), 34))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_form_is_64_chars() {
        let id = PeerId::from_public_key(b"some-canonical-public-key");
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn raw_round_trips() {
        let id = PeerId::from_public_key(b"another-key");
        let mut buf = Vec::new();
        id.encode_raw(&mut buf);
        assert_eq!(buf.len(), 34);
        let (decoded, consumed) = PeerId::decode_raw(&buf).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(consumed, 34);
    }

    #[test]
    fn lexicographic_ordering_is_stable() {
        let a = PeerId::from_bytes([0u8; 32]);
        let mut hi = [0u8; 32];
        hi[0] = 0xFF;
        let b = PeerId::from_bytes(hi);
        assert!(a < b);
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let mut buf = vec![0x00, 0x00];
        buf.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            PeerId::decode_raw(&buf),
            Err(ProtoError::UnknownSignature)
        );
    }
}
