// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Plain SHA-256, used for peer ids and NetGroup addresses (§3).

use sha2::{Digest, Sha256};

/// `SHA-256(data)`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `SHA-256(SHA-256(data))`, used for NetGroup v2 groupspec ids (§9 open
/// question: "token `7F 02`... the spec applies SHA-256 twice").
#[must_use]
pub fn sha256_twice(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn double_hash_differs_from_single() {
        assert_ne!(sha256(b"groupspec"), sha256_twice(b"groupspec"));
    }
}
