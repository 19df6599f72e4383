use std::time::Duration;

use haven_crypto::RatchetConfig;

use crate::error::TransferError;

/// Default plaintext chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest chunk size a receiver accepts in an offer.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Default cap on an offered file: 1 TiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 40;

/// Default cap on a file received into memory: 512 MiB.
pub const DEFAULT_MAX_MEMORY_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Per-session tuning. Every field has a working default.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Chunks sent but not yet acknowledged.
    pub max_in_flight: usize,
    /// First retransmission deadline; doubles per attempt.
    pub ack_timeout: Duration,
    pub max_backoff: Duration,
    /// Retransmissions allowed per chunk before the session fails.
    pub max_retries: u32,
    pub handshake_timeout: Duration,
    /// No frame from the peer for this long fails an active session.
    pub inactivity_timeout: Duration,
    /// How long a sender waits for the receiver's hash verdict.
    pub completion_timeout: Duration,
    /// Receiver gap scan period.
    pub nack_interval: Duration,
    /// Writes suspend while the channel buffers more than this...
    pub high_water: usize,
    /// ...and resume once it drains to this.
    pub low_water: usize,
    /// Receivers refuse manifests for larger files.
    pub max_file_size: u64,
    /// Tighter cap applied when receiving into memory.
    pub max_memory_file_size: u64,
    pub ratchet: RatchetConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: 32,
            ack_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_retries: 8,
            handshake_timeout: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(30),
            nack_interval: Duration::from_millis(250),
            high_water: 1024 * 1024,
            low_water: 256 * 1024,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_memory_file_size: DEFAULT_MAX_MEMORY_FILE_SIZE,
            ratchet: RatchetConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.max_in_flight == 0 {
            return Err(TransferError::Config("max_in_flight must be at least 1".into()));
        }
        if self.low_water >= self.high_water {
            return Err(TransferError::Config(
                "low water mark must be below the high water mark".into(),
            ));
        }
        if self.max_memory_file_size > self.max_file_size {
            return Err(TransferError::Config(
                "in-memory file cap must not exceed max_file_size".into(),
            ));
        }
        if self.ratchet.max_skip < self.max_in_flight {
            return Err(TransferError::Config(
                "ratchet skip tolerance must cover the send window".into(),
            ));
        }
        Ok(())
    }

    /// Retransmission deadline for the given attempt (1 = first send).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.ack_timeout
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Recipients served at the same time; the rest queue as Pending.
    pub max_concurrent_sessions: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
        }
    }
}
