use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ranges::RangeSet;

/// Identifies one peer-to-peer transfer. Travels on the wire as 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies a send-to-many operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of a remote endpoint, normally a public-key fingerprint.
/// Supplied by signaling; the engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Lowercase hex SHA-256 fingerprint of a public key.
    pub fn from_key_bytes(key: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole file.
    pub content_hash: String,
}

impl FileMetadata {
    /// Chunks needed for this file. An empty file still travels as one empty chunk.
    pub fn chunk_count(&self, chunk_size: u32) -> u32 {
        chunk_count(self.size, chunk_size)
    }
}

/// Saturates at `u32::MAX`; use [`checked_chunk_count`] on untrusted sizes.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    checked_chunk_count(size, chunk_size).unwrap_or(u32::MAX)
}

/// None if `chunk_size` is zero or the file needs more than `u32::MAX` chunks.
pub fn checked_chunk_count(size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(size.div_ceil(chunk_size as u64).max(1)).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// Whether a session stands alone or is one recipient of a group send.
/// Session logic is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionKind {
    Single,
    GroupMember { group_id: GroupId },
}

impl SessionKind {
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Single => None,
            Self::GroupMember { group_id } => Some(*group_id),
        }
    }
}

/// Durable progress of one transfer, written after every ACK change and
/// every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub peer: PeerIdentity,
    pub direction: Direction,
    pub kind: SessionKind,
    pub file: FileMetadata,
    pub chunk_size: u32,
    pub status: TransferStatus,
    pub acked: RangeSet,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(
        transfer_id: TransferId,
        peer: PeerIdentity,
        direction: Direction,
        kind: SessionKind,
        file: FileMetadata,
        chunk_size: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id,
            peer,
            direction,
            kind,
            file,
            chunk_size,
            status: TransferStatus::Pending,
            acked: RangeSet::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.file.chunk_count(self.chunk_size)
    }

    pub fn all_acked(&self) -> bool {
        self.acked.is_complete(self.chunk_count())
    }

    /// Move to `status`, refusing to leave a terminal state.
    /// Returns true if the status changed.
    pub fn transition(&mut self, status: TransferStatus) -> bool {
        if self.status == status || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
