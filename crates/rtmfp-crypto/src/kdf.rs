// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session key derivation (§4.3).
//!
//! ```text
//! hmac1      = HMAC-SHA256(key = S,     msg = Ni)
//! requestKey = HMAC-SHA256(key = hmac1, msg = Nr)   // initiator -> responder
//! hmac2      = HMAC-SHA256(key = S,     msg = Nr)
//! responseKey= HMAC-SHA256(key = hmac2, msg = Ni)   // responder -> initiator
//! ```
//! Both outputs are truncated to 16 bytes for AES-128.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The two session keys produced by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key for messages flowing initiator -> responder.
    pub request_key: [u8; 16],
    /// Key for messages flowing responder -> initiator.
    pub response_key: [u8; 16],
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    // HMAC accepts any key length, so new_from_slice never actually fails here;
    // fall back to a zeroed block-sized key rather than unwrap to stay panic-free.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| <HmacSha256 as Mac>::new(&Default::default()));
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn truncate16(full: [u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

/// Derive `(requestKey, responseKey)` from the raw DH shared secret and both
/// nonces, per §4.3.
#[must_use]
pub fn derive_session_keys(shared_secret: &[u8], ni: &[u8], nr: &[u8]) -> SessionKeys {
    let hmac1 = hmac_sha256(shared_secret, ni);
    let request_key = truncate16(hmac_sha256(&hmac1, nr));

    let hmac2 = hmac_sha256(shared_secret, nr);
    let response_key = truncate16(hmac_sha256(&hmac2, ni));

    SessionKeys {
        request_key,
        response_key,
    }
}

/// Derive the NetGroup activation key for a peer session (§4.8.1):
/// `HMAC-SHA256(key = HMAC-SHA256(key = sharedSecret, msg = nonce), msg = groupIdTxt)`.
#[must_use]
pub fn derive_group_key(shared_secret: &[u8], nonce: &[u8], group_id_txt: &[u8]) -> [u8; 32] {
    let inner = hmac_sha256(shared_secret, nonce);
    hmac_sha256(&inner, group_id_txt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_peers_derive_identical_keys() {
        let s = b"shared-secret-bytes-from-dh-agreement";
        let ni = b"initiator-nonce-Ni";
        let nr = b"responder-nonce-Nr";

        let initiator_view = derive_session_keys(s, ni, nr);
        let responder_view = derive_session_keys(s, ni, nr);

        assert_eq!(initiator_view, responder_view);
        assert_ne!(initiator_view.request_key, initiator_view.response_key);
    }

    #[test]
    fn different_nonces_produce_different_keys() {
        let s = b"shared-secret";
        let a = derive_session_keys(s, b"Ni-a", b"Nr-a");
        let b = derive_session_keys(s, b"Ni-b", b"Nr-b");
        assert_ne!(a.request_key, b.request_key);
        assert_ne!(a.response_key, b.response_key);
    }

    #[test]
    fn group_key_depends_on_group_id() {
        let s = b"shared-secret";
        let nonce = b"far-nonce";
        let a = derive_group_key(s, nonce, b"group-one");
        let b = derive_group_key(s, nonce, b"group-two");
        assert_ne!(a, b);
    }
}
