/// Haven Crypto Library
///
/// End-to-end protection for peer-to-peer file transfers:
/// - Hybrid key agreement (X25519 + Kyber-1024, HKDF-SHA256 combiner,
///   ephemeral keys on both sides, mutual key confirmation)
/// - Ratcheting AES-256-GCM session with one key per chunk, bounded
///   skipped-key cache, periodic DH turns and a per-session control MAC
///
/// Key material is zeroed when dropped or explicitly wiped.

pub mod agreement;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod ratchet;

pub use agreement::{
    HandshakeOffer, HandshakeResponse, PendingAgreement, SessionKeys, SharedSecret, agree, initiate,
};
pub use error::{HandshakeError, RatchetError};
pub use keys::{HybridKeyPair, HybridPublicKey};
pub use ratchet::{
    Announcement, CONTROL_TAG_LEN, HEADER_LEN, RatchetConfig, RatchetHeader, RatchetSession, Role,
    TAG_LEN,
};
