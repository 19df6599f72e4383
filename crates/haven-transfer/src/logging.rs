/// Structured transfer logging.
///
/// Sessions report typed events through a `TransferLogger`, so tests can
/// capture them and the node can route them to `tracing`.

use std::fmt;
use std::sync::Mutex;

use haven_types::{PeerIdentity, TransferId, TransferStatus};

/// One log entry, attributed to a transfer and the peer it is with.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: TransferId,
    pub peer: PeerIdentity,
    pub event: TransferEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Both confirmation tags verified; a fresh ratchet is live.
    HandshakeComplete {
        resumed_chunks: u64,
    },
    /// Sender: chunk encrypted and written to the channel
    ChunkSent {
        sequence: u32,
        epoch: u32,
        size: usize,
    },
    /// Sender: chunk re-encrypted after a NACK or ACK timeout
    ChunkRetransmitted {
        sequence: u32,
        attempt: u32,
    },
    AckReceived {
        cumulative: u32,
        acked: u64,
    },
    NackSent {
        first: u32,
        missing: u64,
    },
    NackReceived {
        first: u32,
        missing: u64,
    },
    /// Receiver: chunk failed authentication or integrity
    ChunkRejected {
        sequence: u32,
        reason: String,
    },
    /// Sender side of the ratchet moved to a new epoch
    RatchetTurned {
        epoch: u32,
    },
    StatusChanged {
        from: TransferStatus,
        to: TransferStatus,
    },
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
        retransmits: u64,
    },
    /// Control frame or Ack/Nack that failed authentication, or a
    /// cleartext control message after the handshake
    FrameRejected {
        kind: &'static str,
        reason: String,
    },
    /// Frame addressed to a different transfer on this channel
    TransferIdMismatch {
        got: TransferId,
    },
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeComplete { resumed_chunks } => {
                write!(f, "handshake_complete resumed={}", resumed_chunks)
            }
            Self::ChunkSent { sequence, epoch, size } => {
                write!(f, "chunk_sent seq={} epoch={} size={}", sequence, epoch, size)
            }
            Self::ChunkRetransmitted { sequence, attempt } => {
                write!(f, "chunk_retransmitted seq={} attempt={}", sequence, attempt)
            }
            Self::AckReceived { cumulative, acked } => {
                write!(f, "ack_received cumulative={} acked={}", cumulative, acked)
            }
            Self::NackSent { first, missing } => {
                write!(f, "nack_sent first={} missing={}", first, missing)
            }
            Self::NackReceived { first, missing } => {
                write!(f, "nack_received first={} missing={}", first, missing)
            }
            Self::ChunkRejected { sequence, reason } => {
                write!(f, "chunk_rejected seq={}: {}", sequence, reason)
            }
            Self::RatchetTurned { epoch } => {
                write!(f, "ratchet_turned epoch={}", epoch)
            }
            Self::StatusChanged { from, to } => {
                write!(f, "status {} -> {}", from, to)
            }
            Self::TransferComplete { total_bytes, duration_ms, retransmits } => {
                write!(f, "transfer_complete bytes={} duration_ms={} retransmits={}", total_bytes, duration_ms, retransmits)
            }
            Self::FrameRejected { kind, reason } => {
                write!(f, "frame_rejected kind={}: {}", kind, reason)
            }
            Self::TransferIdMismatch { got } => {
                write!(f, "transfer_id_mismatch got={}", got)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Info for lifecycle, warn for faults, debug for per-chunk traffic
        match &entry.event {
            TransferEvent::HandshakeComplete { .. }
            | TransferEvent::StatusChanged { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::RatchetTurned { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::ChunkRejected { .. }
            | TransferEvent::FrameRejected { .. }
            | TransferEvent::TransferIdMismatch { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Keeps every entry in memory. Used by tests to assert on protocol traffic.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<TransferLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TransferLog> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events for one component ("sender" / "receiver").
    pub fn events(&self, component: &str) -> Vec<TransferEvent> {
        self.entries()
            .into_iter()
            .filter(|e| e.component == component)
            .map(|e| e.event)
            .collect()
    }
}

impl TransferLogger for MemoryLogger {
    fn log(&self, entry: TransferLog) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = TransferEvent::NackSent { first: 42, missing: 1 };
        assert_eq!(event.to_string(), "nack_sent first=42 missing=1");

        let event = TransferEvent::StatusChanged {
            from: TransferStatus::Active,
            to: TransferStatus::Paused,
        };
        assert_eq!(event.to_string(), "status active -> paused");

        let event = TransferEvent::FrameRejected {
            kind: "ack",
            reason: "bad tag".into(),
        };
        assert_eq!(event.to_string(), "frame_rejected kind=ack: bad tag");
    }

    #[test]
    fn test_memory_logger_filters_by_component() {
        let logger = MemoryLogger::new();
        let tid = TransferId::new();
        for component in ["sender", "receiver", "sender"] {
            logger.log(TransferLog {
                component,
                transfer_id: tid,
                peer: PeerIdentity::new("p"),
                event: TransferEvent::RatchetTurned { epoch: 1 },
            });
        }
        assert_eq!(logger.events("sender").len(), 2);
        assert_eq!(logger.events("receiver").len(), 1);
    }
}
