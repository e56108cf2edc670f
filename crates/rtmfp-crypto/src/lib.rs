// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cryptographic primitives the RTMFP session layer is built on: the
//! per-session AES-128-CBC codec, the CRC-16 packet guard, 1024-bit
//! Diffie-Hellman key agreement, and the HMAC-SHA256 key/group-key
//! derivation chain (§4.1, §4.3, §4.8.1).
//!
//! This crate treats the primitives themselves as vetted building blocks
//! (RustCrypto's `aes`/`cbc`/`hmac`/`sha2`); what RTMFP adds on top —
//! the derivation sequence, the zero-IV CBC convention, the CRC layout —
//! is what lives here.

mod crc;
mod dh;
mod engine;
mod error;
mod hash;
mod kdf;

pub use crc::checksum;
pub use dh::DhKeyPair;
pub use engine::{Engine, HANDSHAKE_KEY};
pub use error::CryptoError;
pub use hash::{sha256, sha256_twice};
pub use kdf::{derive_group_key, derive_session_keys, SessionKeys};
