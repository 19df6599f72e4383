/// Chunking, per-chunk integrity and reassembly.
///
/// ```text
/// file:  |---- chunk 0 ----|---- chunk 1 ----| ... |- chunk n-1 -|
///         chunk_size bytes each, the last one may be shorter;
///         an empty file is one empty chunk
///
/// tag = SHA-256(transfer_id | sequence u32 BE | payload)
///
/// encrypted body: [0..4]   sequence (u32 BE)
///                 [4..36]  tag
///                 [36..]   payload
/// ```
///
/// The source file is read once into a shared `Bytes` buffer; every group
/// member slices plaintext from the same `ChunkStore` without copying or
/// locking. Received chunks go straight to a `.part` file at
/// `sequence * chunk_size`, which survives a restart.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use haven_types::{FileMetadata, RangeSet, TransferId, checked_chunk_count, chunk_count};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{ChunkError, TransferError};

pub const CHUNK_TAG_LEN: usize = 32;

/// Sequence + tag in front of every encrypted payload.
pub const BODY_HEADER: usize = 4 + CHUNK_TAG_LEN;

/// Read size when hashing a finished `.part` file.
const HASH_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: TransferId,
    pub sequence: u32,
    pub payload: Bytes,
    pub tag: [u8; CHUNK_TAG_LEN],
}

impl Chunk {
    pub fn new(transfer_id: TransferId, sequence: u32, payload: Bytes) -> Self {
        let tag = chunk_tag(&transfer_id, sequence, &payload);
        Self {
            transfer_id,
            sequence,
            payload,
            tag,
        }
    }

    pub fn verify(&self) -> bool {
        chunk_tag(&self.transfer_id, self.sequence, &self.payload) == self.tag
    }
}

pub fn chunk_tag(transfer_id: &TransferId, sequence: u32, payload: &[u8]) -> [u8; CHUNK_TAG_LEN] {
    let mut h = Sha256::new();
    h.update(transfer_id.as_bytes());
    h.update(sequence.to_be_bytes());
    h.update(payload);
    h.finalize().into()
}

/// Lowercase hex SHA-256.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Iterator over the chunks of a buffer. Cloning restarts nothing; call
/// [`split`] again for a fresh pass, which yields identical chunks.
#[derive(Debug, Clone)]
pub struct Chunks {
    transfer_id: TransferId,
    data: Bytes,
    chunk_size: usize,
    next: u32,
    total: u32,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.total {
            return None;
        }
        let sequence = self.next;
        self.next += 1;
        let payload = slice_chunk(&self.data, self.chunk_size, sequence);
        Some(Chunk::new(self.transfer_id, sequence, payload))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks {}

pub fn split(transfer_id: TransferId, data: Bytes, chunk_size: u32) -> Chunks {
    let total = chunk_count(data.len() as u64, chunk_size);
    Chunks {
        transfer_id,
        data,
        chunk_size: chunk_size as usize,
        next: 0,
        total,
    }
}

fn slice_chunk(data: &Bytes, chunk_size: usize, sequence: u32) -> Bytes {
    let start = (sequence as usize).saturating_mul(chunk_size).min(data.len());
    let end = start.saturating_add(chunk_size).min(data.len());
    data.slice(start..end)
}

/// Rebuild the original bytes. Duplicates are ignored; every sequence in
/// `[0, total)` must be present and pass its tag.
pub fn reassemble(
    total: u32,
    chunks: impl IntoIterator<Item = Chunk>,
) -> Result<Vec<u8>, ChunkError> {
    let mut by_sequence = BTreeMap::new();
    for chunk in chunks {
        if chunk.sequence < total {
            by_sequence.entry(chunk.sequence).or_insert(chunk);
        }
    }

    let present: RangeSet = by_sequence.keys().copied().collect();
    if !present.is_complete(total) {
        return Err(ChunkError::SequenceGap {
            missing: present.missing(total),
        });
    }

    let mut out = Vec::with_capacity(by_sequence.values().map(|c| c.payload.len()).sum());
    for chunk in by_sequence.values() {
        if !chunk.verify() {
            return Err(ChunkError::Integrity {
                sequence: chunk.sequence,
            });
        }
        out.extend_from_slice(&chunk.payload);
    }
    Ok(out)
}

/// Plaintext handed to the ratchet for one chunk.
pub fn seal_body(chunk: &Chunk) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(BODY_HEADER + chunk.payload.len());
    buf.put_u32(chunk.sequence);
    buf.put_slice(&chunk.tag);
    buf.put_slice(&chunk.payload);
    buf.to_vec()
}

/// Check a decrypted body against the sequence its frame claimed.
pub fn open_body(
    transfer_id: TransferId,
    expected_sequence: u32,
    body: &[u8],
) -> Result<Chunk, ChunkError> {
    let integrity = ChunkError::Integrity {
        sequence: expected_sequence,
    };
    if body.len() < BODY_HEADER {
        return Err(integrity);
    }
    let sequence = u32::from_be_bytes(body[..4].try_into().unwrap());
    if sequence != expected_sequence {
        return Err(integrity);
    }
    let mut tag = [0u8; CHUNK_TAG_LEN];
    tag.copy_from_slice(&body[4..BODY_HEADER]);

    let chunk = Chunk {
        transfer_id,
        sequence,
        payload: Bytes::copy_from_slice(&body[BODY_HEADER..]),
        tag,
    };
    if !chunk.verify() {
        return Err(integrity);
    }
    Ok(chunk)
}

/// Read-only, chunk-addressable source file.
#[derive(Debug)]
pub struct ChunkStore {
    data: Bytes,
    metadata: FileMetadata,
    chunk_size: u32,
}

impl ChunkStore {
    pub async fn open(path: &Path, chunk_size: u32) -> Result<Self, TransferError> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());

        let hashed = data.clone();
        let hash = tokio::task::spawn_blocking(move || content_hash(&hashed))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;

        info!(path = %path.display(), size = data.len(), "source file loaded");
        Self::build(name, data, hash, chunk_size)
    }

    pub fn from_bytes(
        name: impl Into<String>,
        data: impl Into<Bytes>,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        let data = data.into();
        let hash = content_hash(&data);
        Self::build(name.into(), data, hash, chunk_size)
    }

    fn build(name: String, data: Bytes, hash: String, chunk_size: u32) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::Config("chunk size must be at least 1 byte".into()));
        }
        if checked_chunk_count(data.len() as u64, chunk_size).is_none() {
            return Err(TransferError::Config(format!(
                "{} bytes in chunks of {} exceeds the chunk sequence space",
                data.len(),
                chunk_size
            )));
        }
        let metadata = FileMetadata {
            name,
            size: data.len() as u64,
            content_hash: hash,
        };
        Ok(Self {
            data,
            metadata,
            chunk_size,
        })
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.metadata.chunk_count(self.chunk_size)
    }

    pub fn payload(&self, sequence: u32) -> Option<Bytes> {
        (sequence < self.chunk_count())
            .then(|| slice_chunk(&self.data, self.chunk_size as usize, sequence))
    }

    pub fn chunk(&self, transfer_id: TransferId, sequence: u32) -> Option<Chunk> {
        self.payload(sequence)
            .map(|payload| Chunk::new(transfer_id, sequence, payload))
    }

    pub fn split(&self, transfer_id: TransferId) -> Chunks {
        split(transfer_id, self.data.clone(), self.chunk_size)
    }
}

/// Where a receiver puts incoming data.
#[derive(Debug, Clone)]
pub enum ReceiveTarget {
    /// `.part` file in this directory, renamed to the offered file name when
    /// complete.
    Directory(PathBuf),
    /// Kept in memory. Lost with the process; used by tests and the demo.
    Memory,
}

/// A finished, verified transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedFile {
    Path(PathBuf),
    Memory(Bytes),
}

enum Sink {
    File {
        dir: PathBuf,
        part_path: PathBuf,
        handle: tokio::fs::File,
    },
    Memory(Vec<u8>),
}

/// Receive-side writer. Chunks may arrive in any order.
pub struct Reassembler {
    transfer_id: TransferId,
    file: FileMetadata,
    chunk_size: u32,
    sink: Sink,
}

impl Reassembler {
    /// Open (or reopen, keeping existing contents) the sink for a transfer.
    pub async fn open(
        target: &ReceiveTarget,
        transfer_id: TransferId,
        file: FileMetadata,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        let sink = match target {
            ReceiveTarget::Directory(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let part_path = dir.join(format!("{}.part", transfer_id));
                let handle = tokio::fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(&part_path)
                    .await?;
                debug!(path = %part_path.display(), "part file opened");
                Sink::File {
                    dir: dir.clone(),
                    part_path,
                    handle,
                }
            }
            ReceiveTarget::Memory => Sink::Memory(Vec::new()),
        };
        Ok(Self {
            transfer_id,
            file,
            chunk_size,
            sink,
        })
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    fn expected_len(&self, sequence: u32) -> Option<usize> {
        let total = self.file.chunk_count(self.chunk_size);
        if sequence >= total {
            return None;
        }
        let offset = sequence as u64 * self.chunk_size as u64;
        Some((self.file.size.saturating_sub(offset)).min(self.chunk_size as u64) as usize)
    }

    /// Write one verified payload at its offset.
    pub async fn write(&mut self, sequence: u32, payload: &[u8]) -> Result<(), TransferError> {
        if self.expected_len(sequence) != Some(payload.len()) {
            return Err(ChunkError::Integrity { sequence }.into());
        }
        let offset = sequence as u64 * self.chunk_size as u64;
        match &mut self.sink {
            Sink::File { handle, .. } => {
                handle.seek(SeekFrom::Start(offset)).await?;
                handle.write_all(payload).await?;
                handle.flush().await?;
            }
            Sink::Memory(buf) => {
                let start = offset as usize;
                let end = start + payload.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(payload);
            }
        }
        Ok(())
    }

    /// Verify the whole-file hash and move the result into place. A mismatch
    /// discards the partial data.
    pub async fn finish(self) -> Result<ReceivedFile, TransferError> {
        let expected = self.file.content_hash.clone();
        match self.sink {
            Sink::Memory(mut buf) => {
                buf.resize(self.file.size as usize, 0);
                let actual = content_hash(&buf);
                if actual != expected {
                    return Err(TransferError::ContentHashMismatch { expected, actual });
                }
                Ok(ReceivedFile::Memory(Bytes::from(buf)))
            }
            Sink::File {
                dir,
                part_path,
                mut handle,
            } => {
                handle.set_len(self.file.size).await?;
                handle.seek(SeekFrom::Start(0)).await?;

                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; HASH_BUF];
                loop {
                    let n = handle.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                drop(handle);

                let actual = hex::encode(hasher.finalize());
                if actual != expected {
                    warn!(path = %part_path.display(), "content hash mismatch, discarding part file");
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err(TransferError::ContentHashMismatch { expected, actual });
                }

                let mut dest = dir.join(sanitize_name(&self.file.name));
                if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                    let short = self.transfer_id.to_string();
                    dest = dir.join(format!("{}-{}", &short[..8], sanitize_name(&self.file.name)));
                }
                tokio::fs::rename(&part_path, &dest).await?;
                info!(path = %dest.display(), size = self.file.size, "file received");
                Ok(ReceivedFile::Path(dest))
            }
        }
    }
}

/// Longest file name most filesystems accept, in bytes.
const MAX_NAME_LEN: usize = 255;

const FALLBACK_NAME: &str = "download";

/// Device names Windows opens as devices regardless of extension.
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM0", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT0", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reduce a name chosen by the remote peer to a single safe file name
/// inside the receive directory.
///
/// Escape sequences and control characters are removed, every separator
/// (including backslash and the fullwidth forms) splits components, and
/// the last component that survives cleaning is kept: no dot-only or
/// `~`-prefixed parts, no drive prefix, no colon, no trailing dot or space,
/// at most 255 bytes, Windows device names defused with a `_` prefix.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = strip_ansi(name)
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '\\' | '\u{FF0F}' | '\u{FF3C}' | '\u{2215}' => '/',
            other => other,
        })
        .collect();

    cleaned
        .split('/')
        .filter_map(clean_component)
        .last()
        .unwrap_or_else(|| FALLBACK_NAME.into())
}

fn clean_component(part: &str) -> Option<String> {
    let mut part = part.trim();
    if part.is_empty() || part == "." || part == ".." || part.starts_with('~') {
        return None;
    }
    while part.len() >= 2 && part.as_bytes()[0].is_ascii_alphabetic() && part.as_bytes()[1] == b':' {
        part = &part[2..];
    }
    let no_colons = part.replace(':', "_");
    let part = no_colons.trim_end_matches(['.', ' ']);
    if part.is_empty() {
        return None;
    }

    let stem = part.split('.').next().unwrap_or(part);
    let mut out = if WINDOWS_RESERVED.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        format!("_{}", part)
    } else {
        part.to_string()
    };
    if out.len() > MAX_NAME_LEN {
        let mut cut = MAX_NAME_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    Some(out)
}

/// Drop ANSI escape sequences: CSI (`ESC [ ... final`), OSC (`ESC ] ...`
/// ended by BEL or `ESC \`) and two-byte escapes.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}
