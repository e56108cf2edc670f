// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! 1024-bit Diffie-Hellman key agreement over the IETF MODP group (RFC 2409
//! group 2), as used for the RTMFP handshake (§4.2).

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;

use crate::error::CryptoError;

/// RFC 2409 second Oakley group: a 1024-bit MODP prime.
const MODP_1024_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);
const GENERATOR: u64 = 2;

/// A DH key pair: a random secret exponent and the corresponding public
/// value `g^x mod p`.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: BigUint,
    public: BigUint,
}

fn modp_1024() -> BigUint {
    BigUint::parse_bytes(MODP_1024_HEX.as_bytes(), 16)
        .unwrap_or_else(|| BigUint::from(0u8))
}

impl DhKeyPair {
    /// Generate a fresh key pair using the given RNG.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let p = modp_1024();
        let mut secret_bytes = vec![0u8; 128];
        rng.fill_bytes(&mut secret_bytes);
        let mut secret = BigUint::from_bytes_be(&secret_bytes) % (&p - BigUint::one());
        if secret.is_zero() {
            secret = BigUint::one();
        }
        let public = BigUint::from(GENERATOR).modpow(&secret, &p);
        Self { secret, public }
    }

    /// The public value to send to the peer, big-endian encoded.
    #[must_use]
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Compute the raw shared secret `peer_public^secret mod p`.
    pub fn agree(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let p = modp_1024();
        let peer = BigUint::from_bytes_be(peer_public);
        if peer.is_zero() || peer >= p {
            return Err(CryptoError::InvalidPublicValue);
        }
        let shared = peer.modpow(&self.secret, &p);
        Ok(shared.to_bytes_be())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn both_sides_agree_on_same_secret() {
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let a = DhKeyPair::generate(&mut rng_a);
        let b = DhKeyPair::generate(&mut rng_b);

        let secret_a = a.agree(&b.public_bytes()).unwrap();
        let secret_b = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn rejects_zero_public_value() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = DhKeyPair::generate(&mut rng);
        assert!(a.agree(&[0u8]).is_err());
    }
}
