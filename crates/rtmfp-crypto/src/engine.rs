// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-session AES-128-CBC codec (§4.1).
//!
//! RTMFP always runs CBC with a zero IV and relies on the embedded CRC and
//! timestamp to defeat the resulting determinism across independent
//! sessions (each session has its own key). Padding is the caller's job
//! (§4.1 "outgoing padding"); the [`Engine`] only ever operates on buffers
//! that are already a multiple of the block size.

use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};

use crate::error::CryptoError;

const BLOCK: usize = 16;
const ZERO_IV: [u8; BLOCK] = [0u8; BLOCK];

/// The default handshake decryption key, `"Adobe Systems 02"`, used before a
/// session has negotiated its own `requestKey`/`responseKey` (§4.1, §4.2).
pub const HANDSHAKE_KEY: &[u8; 16] = b"Adobe Systems 02";

/// A single-direction AES-128-CBC codec bound to one 16-byte key.
///
/// Sessions hold two of these: `enc` (outbound) and `dec` (inbound), each
/// derived independently per §4.3.
#[derive(Clone)]
pub struct Engine {
    key: [u8; 16],
}

impl Engine {
    /// Build an engine from a raw 16-byte AES-128 key.
    #[must_use]
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Engine for the well-known handshake key.
    #[must_use]
    pub fn handshake() -> Self {
        Self::new(*HANDSHAKE_KEY)
    }

    /// Encrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % BLOCK != 0 {
            return Err(CryptoError::Unaligned(buf.len()));
        }
        let mut enc = Encryptor::<Aes128>::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&ZERO_IV),
        );
        for chunk in buf.chunks_mut(BLOCK) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }

    /// Decrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn decode(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % BLOCK != 0 {
            return Err(CryptoError::Unaligned(buf.len()));
        }
        let mut dec = Decryptor::<Aes128>::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&ZERO_IV),
        );
        for chunk in buf.chunks_mut(BLOCK) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        let engine = Engine::new(*b"0123456789abcdef");
        let plain = b"0123456789abcdef0123456789abcdef".to_vec();
        let mut buf = plain.clone();
        engine.encode(&mut buf).unwrap();
        assert_ne!(buf, plain);
        engine.decode(&mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn handshake_key_is_adobe_systems_02() {
        assert_eq!(HANDSHAKE_KEY, b"Adobe Systems 02");
    }

    #[test]
    fn rejects_unaligned_buffers() {
        let engine = Engine::handshake();
        let mut buf = vec![0u8; 17];
        assert!(matches!(
            engine.encode(&mut buf),
            Err(CryptoError::Unaligned(17))
        ));
    }

    #[test]
    fn different_keys_produce_different_ciphertext() {
        let a = Engine::new(*b"0123456789abcdef");
        let b = Engine::new(*b"fedcba9876543210");
        let plain = *b"same plaintext!!";
        let mut ca = plain;
        let mut cb = plain;
        a.encode(&mut ca).unwrap();
        b.encode(&mut cb).unwrap();
        assert_ne!(ca, cb);
    }
}
