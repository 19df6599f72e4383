/// Haven Transfer: encrypted peer-to-peer file transfer engine.
///
/// Provides resumable, end-to-end encrypted transfers over an abstract
/// data channel with:
/// - Hybrid post-quantum handshake and a fresh ratchet per connection
/// - Windowed sending with ACK/NACK range lists and exponential backoff
/// - Backpressure on the channel's buffered amount (high/low water marks)
/// - Persisted progress: acknowledged chunks are never sent twice
/// - Group fan-out with bounded concurrency and per-recipient isolation
/// - In-memory channel pairs for tests and local demos

pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod group;
pub mod logging;
pub mod memory;
pub mod protocol;
mod receiver;
mod sender;
pub mod session;

// Re-export key types for convenience.
pub use channel::{ChannelWriter, DataChannel, TransportError, TransportHandle};
pub use chunk::{Chunk, ChunkStore, Chunks, ReceiveTarget, ReceivedFile, Reassembler, reassemble, split};
pub use config::{DEFAULT_CHUNK_SIZE, GroupConfig, MAX_CHUNK_SIZE, TransferConfig};
pub use error::{ChunkError, TransferError};
pub use group::{GroupOutcome, GroupProgress, GroupTransferController, MemberOutcome};
pub use logging::{MemoryLogger, NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use memory::{FrameAction, MemoryConfig, MemoryLink};
pub use protocol::{ControlMessage, Frame, FrameType, HandshakeMessage, Manifest, decode_frame};
pub use session::{
    PeerLink, SessionControl, SessionHandle, SessionSnapshot, SessionState, TransferSession,
};
