use thiserror::Error;

/// Key agreement failures. Always fatal to the handshake; the caller starts
/// over with a fresh ephemeral key pair.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("malformed KEM ciphertext: expected {expected} bytes, got {got}")]
    MalformedCiphertext { expected: usize, got: usize },
    #[error("X25519 exchange produced a non-contributory shared secret")]
    NonContributory,
    #[error("key confirmation failed")]
    ConfirmationFailed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// AEAD tag did not verify: tampering, corruption or a desynchronized chain.
    #[error("authentication failed for epoch {epoch} message {counter}")]
    Authentication { epoch: u32, counter: u64 },
    /// Message key already consumed.
    #[error("replayed message: epoch {epoch} message {counter}")]
    Replay { epoch: u32, counter: u64 },
    /// Further ahead than the skipped-key cache tolerates.
    #[error("message outside skip tolerance: epoch {epoch} message {counter}")]
    TooFarAhead { epoch: u32, counter: u64 },
    #[error("ratchet header is malformed")]
    MalformedHeader,
    #[error("encryption failed")]
    Encryption,
    #[error("ratchet session has been wiped")]
    Destroyed,
}
