/// Haven shared data model.
///
/// Identifiers, file metadata, transfer status and the persisted
/// `TransferRecord`, plus `RangeSet` for tracking acknowledged chunks.

pub mod models;
pub mod ranges;

pub use models::{
    checked_chunk_count, chunk_count, Direction, FileMetadata, GroupId, PeerIdentity, SessionKind,
    TransferId, TransferRecord, TransferStatus,
};
pub use ranges::RangeSet;
