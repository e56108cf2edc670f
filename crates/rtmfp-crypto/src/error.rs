// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for the crypto layer.

use thiserror::Error;

/// Failures from the crypto layer: session codec, CRC, and key agreement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Plaintext/ciphertext buffer was not a multiple of the AES block size.
    #[error("buffer length {0} is not 16-byte aligned")]
    Unaligned(usize),
    /// Buffer was shorter than the minimum framing overhead.
    #[error("buffer too short: {0} bytes")]
    TooShort(usize),
    /// CRC field did not match the computed checksum over the body.
    #[error("CRC mismatch: header said {expected:#06x}, computed {computed:#06x}")]
    BadCrc {
        /// Checksum carried in the packet.
        expected: u16,
        /// Checksum computed over the decrypted body.
        computed: u16,
    },
    /// Diffie-Hellman public value was outside the valid range for the group.
    #[error("invalid DH public value")]
    InvalidPublicValue,
    /// Shared secret derivation could not produce a 16-byte session key.
    #[error("key derivation failed: {0}")]
    KeyDerivation(&'static str),
}
