/// Hybrid key material: an X25519 key plus a Kyber-1024 KEM key.
///
/// ```text
/// public key bytes: [0..32]    X25519 public key
///                   [32..1600] Kyber-1024 public key
/// ```
///
/// Public keys travel base64-encoded inside handshake messages and are
/// supplied out of band (signaling) for the responder side.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::HandshakeError;

pub const X25519_KEY_LEN: usize = 32;

pub fn kem_public_key_len() -> usize {
    kyber1024::public_key_bytes()
}

pub fn kem_ciphertext_len() -> usize {
    kyber1024::ciphertext_bytes()
}

/// Public half of a [`HybridKeyPair`].
#[derive(Clone, PartialEq, Eq)]
pub struct HybridPublicKey {
    pub x25519: [u8; X25519_KEY_LEN],
    pub kem: Vec<u8>,
}

impl HybridPublicKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(X25519_KEY_LEN + self.kem.len());
        out.extend_from_slice(&self.x25519);
        out.extend_from_slice(&self.kem);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let expected = X25519_KEY_LEN + kem_public_key_len();
        if bytes.len() != expected {
            return Err(HandshakeError::MalformedKey(format!(
                "expected {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }
        let mut x25519 = [0u8; X25519_KEY_LEN];
        x25519.copy_from_slice(&bytes[..X25519_KEY_LEN]);
        Ok(Self {
            x25519,
            kem: bytes[X25519_KEY_LEN..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HandshakeError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| HandshakeError::MalformedKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub(crate) fn kem_key(&self) -> Result<kyber1024::PublicKey, HandshakeError> {
        kyber1024::PublicKey::from_bytes(&self.kem)
            .map_err(|e| HandshakeError::MalformedKey(e.to_string()))
    }
}

impl std::fmt::Debug for HybridPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HybridPublicKey({}…)", &BASE64.encode(self.x25519)[..8])
    }
}

/// Long-lived or ephemeral hybrid key pair. Secret halves are zeroed on drop.
pub struct HybridKeyPair {
    x25519: StaticSecret,
    x25519_public: PublicKey,
    kem_public: Vec<u8>,
    kem_secret: Zeroizing<Vec<u8>>,
}

impl HybridKeyPair {
    pub fn generate() -> Self {
        let x25519 = StaticSecret::random_from_rng(OsRng);
        let x25519_public = PublicKey::from(&x25519);
        let (kem_public, kem_secret) = kyber1024::keypair();
        Self {
            x25519,
            x25519_public,
            kem_public: kem_public.as_bytes().to_vec(),
            kem_secret: Zeroizing::new(kem_secret.as_bytes().to_vec()),
        }
    }

    pub fn public_key(&self) -> HybridPublicKey {
        HybridPublicKey {
            x25519: *self.x25519_public.as_bytes(),
            kem: self.kem_public.clone(),
        }
    }

    pub fn x25519_public(&self) -> [u8; X25519_KEY_LEN] {
        *self.x25519_public.as_bytes()
    }

    /// Copy of the X25519 secret, held by an initiator until the
    /// responder's ephemeral key arrives.
    pub(crate) fn x25519_secret(&self) -> StaticSecret {
        self.x25519.clone()
    }

    pub(crate) fn diffie_hellman(
        &self,
        remote: &[u8; X25519_KEY_LEN],
    ) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        let shared = self.x25519.diffie_hellman(&PublicKey::from(*remote));
        if !shared.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    /// Kyber decapsulation never reports failure (implicit rejection); a bad
    /// ciphertext surfaces later as a key confirmation mismatch.
    pub(crate) fn decapsulate(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
        let ct = kyber1024::Ciphertext::from_bytes(ciphertext).map_err(|_| {
            HandshakeError::MalformedCiphertext {
                expected: kem_ciphertext_len(),
                got: ciphertext.len(),
            }
        })?;
        let sk = kyber1024::SecretKey::from_bytes(&self.kem_secret)
            .map_err(|e| HandshakeError::MalformedKey(e.to_string()))?;
        let ss = kyber1024::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

/// Encapsulate to a remote KEM key. Returns `(shared_secret, ciphertext)`.
pub(crate) fn encapsulate(
    remote: &HybridPublicKey,
) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), HandshakeError> {
    let pk = remote.kem_key()?;
    let (ss, ct) = kyber1024::encapsulate(&pk);
    Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_bytes_roundtrip() {
        let pair = HybridKeyPair::generate();
        let public = pair.public_key();
        let bytes = public.to_bytes();
        assert_eq!(bytes.len(), X25519_KEY_LEN + kem_public_key_len());
        assert_eq!(HybridPublicKey::from_bytes(&bytes).unwrap(), public);
        assert_eq!(HybridPublicKey::from_base64(&public.to_base64()).unwrap(), public);
    }

    #[test]
    fn test_truncated_public_key_is_rejected() {
        let bytes = HybridKeyPair::generate().public_key().to_bytes();
        let err = HybridPublicKey::from_bytes(&bytes[..100]).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedKey(_)));
        assert!(HybridPublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_low_order_point_is_rejected() {
        let pair = HybridKeyPair::generate();
        let err = pair.diffie_hellman(&[0u8; 32]).unwrap_err();
        assert_eq!(err, HandshakeError::NonContributory);
    }
}
