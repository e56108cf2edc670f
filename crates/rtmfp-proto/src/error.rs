// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire-decoding error type shared across every chunk/header codec in this crate.

use thiserror::Error;

/// Failures from parsing or building RTMFP wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Ran out of bytes while decoding a fixed- or variable-length field.
    #[error("truncated input: expected more bytes")]
    Truncated,
    /// A length-prefixed field declared a size that overruns the buffer.
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverrun {
        /// Length declared by the wire field.
        declared: usize,
        /// Bytes actually remaining in the buffer.
        remaining: usize,
    },
    /// CRC carried by the packet did not match the computed checksum.
    #[error("CRC mismatch: header said {expected:#06x}, computed {computed:#06x}")]
    BadCrc {
        /// Checksum carried in the packet.
        expected: u16,
        /// Checksum computed over the decrypted body.
        computed: u16,
    },
    /// A marker byte did not match any known framing variant.
    #[error("unrecognized marker byte {0:#04x}")]
    UnknownMarker(u8),
    /// A chunk type byte did not match any known chunk.
    #[error("unrecognized chunk type {0:#04x}")]
    UnknownChunk(u8),
    /// A signature block did not match any recognized writer/flow purpose.
    #[error("unrecognized signature")]
    UnknownSignature,
    /// The plaintext body was not a multiple of the AES block size.
    #[error(transparent)]
    Crypto(#[from] rtmfp_crypto::CryptoError),
    /// A datagram exceeded [`crate::header::MAX_PACKET_SIZE`].
    #[error("packet of {0} bytes exceeds the maximum datagram size")]
    PacketTooLarge(usize),
}
