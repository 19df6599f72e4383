use haven_crypto::{HandshakeError, RatchetError};
use haven_types::{GroupId, RangeSet, TransferId};
use thiserror::Error;

use crate::channel::TransportError;

/// Chunk-level failures. Both lead to targeted retransmission rather than
/// failing the transfer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("missing chunks {missing}")]
    SequenceGap { missing: RangeSet },
    #[error("chunk {sequence} failed integrity check")]
    Integrity { sequence: u32 },
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// Fatal; the caller may restart with fresh keys.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("peer rejected the transfer: {0}")]
    Rejected(String),
    #[error("chunk {sequence} failed authentication")]
    Authentication { sequence: u32 },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("chunk {sequence} was replayed")]
    Replay { sequence: u32 },
    /// Local ratchet failure (wiped session, AEAD setup).
    #[error("ratchet: {0}")]
    Ratchet(#[from] RatchetError),
    /// Transient; the session pauses and can be resumed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("chunk {sequence} still unacknowledged after {attempts} retransmissions")]
    RetryBudgetExhausted { sequence: u32, attempts: u32 },
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("peer aborted the transfer: {0}")]
    Aborted(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transfer store: {0:#}")]
    Store(anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),
}

impl TransferError {
    /// Transport loss pauses a session; everything else that reaches the
    /// session loop ends it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}
