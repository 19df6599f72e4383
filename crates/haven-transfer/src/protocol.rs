/// Wire framing for peer-to-peer transfers (all integers big-endian).
///
/// ```text
/// [0]      Protocol version (0x01)
/// [1]      Frame type: 0x01 Handshake | 0x02 Data | 0x03 Ack | 0x04 Nack
/// [2..18]  Transfer ID (UUID, 16 bytes)
///
/// Data:      [18..22] sequence (u32)
///            [22..74] ratchet header (52 bytes)
///            [74..]   ciphertext = AES-256-GCM(seq u32 | tag 32 | payload) + 16-byte GCM tag
///
/// Ack/Nack:  [18..22] sequence (u32): Ack = contiguous prefix held,
///                                     Nack = first requested chunk
///            [22..26] receiver ratchet epoch (u32)
///            [26..58] receiver ratchet public key for the next turn
///            [58..60] range count (u16)
///            [60..]   count x (start u32, end u32), half-open
///            [-32..]  HMAC-SHA256 of all preceding bytes, session control key
///
/// Handshake: [18..]   JSON `HandshakeMessage`
/// ```
///
/// Only the key exchange travels in the clear: `Offer` and `Accept` carry
/// key material and confirmation tags, nothing about the file. Every later
/// control message is a `ControlMessage` sealed with the session ratchet
/// and sent as `Sealed`.
///
/// Ack and Nack carry range lists rather than single sequence numbers so a
/// large transfer that is mostly in order costs one or two ranges per frame.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{BufMut, Bytes, BytesMut};
use haven_crypto::{
    Announcement, CONTROL_TAG_LEN, HEADER_LEN, HandshakeOffer, HandshakeResponse, RatchetHeader,
    RatchetSession,
};
use haven_types::{FileMetadata, RangeSet, TransferId};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

pub const PROTOCOL_VERSION: u8 = 1;

/// Common header: version + type + transfer ID.
pub const FRAME_HEADER: usize = 18;

/// Bytes before the ciphertext in a Data frame.
pub const DATA_HEADER: usize = FRAME_HEADER + 4 + HEADER_LEN;

/// Bytes before the range list in an Ack or Nack frame.
pub const RANGE_HEADER: usize = FRAME_HEADER + 4 + 4 + 32 + 2;

/// Ranges per Ack/Nack frame; the lowest ranges are sent first.
pub const MAX_WIRE_RANGES: usize = 512;

const CONTROL_LABEL: &[u8] = b"control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0x01,
    Data = 0x02,
    Ack = 0x03,
    Nack = 0x04,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Ack),
            0x04 => Some(Self::Nack),
            _ => None,
        }
    }
}

/// Messages carried in Handshake frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HandshakeMessage {
    /// Sender → receiver: opens (or reopens) a transfer.
    Offer {
        version: u8,
        /// Sender's ephemeral X25519 key, base64.
        public_key: String,
        /// Kyber-1024 ciphertext, base64.
        kem_ciphertext: String,
        /// Initiator key-confirmation tag, hex.
        confirm: String,
    },
    /// Receiver → sender: offer verified.
    Accept {
        /// Receiver's fresh X25519 ratchet key, base64.
        ratchet_public: String,
        /// Responder key-confirmation tag, hex.
        confirm: String,
    },
    /// Refusal before any session keys exist.
    Reject { reason: String },
    /// A `ControlMessage` encrypted under the session ratchet.
    Sealed {
        /// Ratchet header, base64.
        header: String,
        /// AES-256-GCM ciphertext, base64.
        ciphertext: String,
    },
}

impl HandshakeMessage {
    pub fn offer(offer: &HandshakeOffer) -> Self {
        Self::Offer {
            version: PROTOCOL_VERSION,
            public_key: BASE64.encode(offer.initiator_x25519),
            kem_ciphertext: BASE64.encode(&offer.kem_ciphertext),
            confirm: hex::encode(offer.confirm),
        }
    }

    pub fn accept(response: &HandshakeResponse) -> Self {
        Self::Accept {
            ratchet_public: BASE64.encode(response.responder_ratchet),
            confirm: hex::encode(response.confirm),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Sealed { .. } => "sealed",
        }
    }
}

/// What a transfer carries. Sent sealed right after the key exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub file: FileMetadata,
    pub chunk_size: u32,
    pub chunk_count: u32,
}

impl Manifest {
    pub fn new(file: &FileMetadata, chunk_size: u32) -> Self {
        Self {
            file: file.clone(),
            chunk_size,
            chunk_count: file.chunk_count(chunk_size),
        }
    }
}

/// Control messages exchanged once the session ratchet is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    /// Sender → receiver: file description.
    Manifest(Manifest),
    /// Receiver → sender: manifest accepted; `acked` lists chunks already held.
    Resume { acked: RangeSet },
    Reject { reason: String },
    /// Receiver → sender: every chunk arrived and the file hash verified.
    Complete { content_hash: String },
    /// Either side: a fatal error ended the transfer.
    Abort { reason: String },
    /// Either side: the user cancelled.
    Cancel { reason: String },
}

impl ControlMessage {
    pub fn resume(acked: &RangeSet) -> Self {
        Self::Resume {
            acked: acked.truncated(MAX_WIRE_RANGES),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "manifest",
            Self::Resume { .. } => "resume",
            Self::Reject { .. } => "reject",
            Self::Complete { .. } => "complete",
            Self::Abort { .. } => "abort",
            Self::Cancel { .. } => "cancel",
        }
    }
}

fn check_version(version: u8) -> Result<(), TransferError> {
    if version != PROTOCOL_VERSION {
        return Err(TransferError::Protocol(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    Ok(())
}

fn decode_key(encoded: &str, what: &str) -> Result<[u8; 32], TransferError> {
    BASE64
        .decode(encoded)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TransferError::Protocol(format!("{} is malformed", what)))
}

/// Decode the key material in an `Offer`. Shape problems are protocol
/// errors; cryptographic problems surface later from key agreement.
pub fn parse_offer(message: &HandshakeMessage) -> Result<HandshakeOffer, TransferError> {
    let HandshakeMessage::Offer {
        version,
        public_key,
        kem_ciphertext,
        confirm,
    } = message
    else {
        return Err(TransferError::Protocol(format!(
            "expected offer, got {}",
            message.name()
        )));
    };
    check_version(*version)?;

    let kem_ciphertext = BASE64
        .decode(kem_ciphertext)
        .map_err(|_| TransferError::Protocol("offer ciphertext is not base64".into()))?;
    Ok(HandshakeOffer {
        initiator_x25519: decode_key(public_key, "offer public key")?,
        kem_ciphertext,
        confirm: parse_tag(confirm)?,
    })
}

pub fn parse_accept(message: &HandshakeMessage) -> Result<HandshakeResponse, TransferError> {
    let HandshakeMessage::Accept {
        ratchet_public,
        confirm,
    } = message
    else {
        return Err(TransferError::Protocol(format!(
            "expected accept, got {}",
            message.name()
        )));
    };
    Ok(HandshakeResponse {
        responder_ratchet: decode_key(ratchet_public, "accept ratchet key")?,
        confirm: parse_tag(confirm)?,
    })
}

/// Decode a hex confirmation tag.
pub fn parse_tag(encoded: &str) -> Result<[u8; 32], TransferError> {
    hex::decode(encoded)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TransferError::Protocol("confirmation tag is malformed".into()))
}

/// Associated data for sealed control messages: transfer id and a label
/// that keeps them apart from chunk ciphertexts.
pub fn control_aad(transfer_id: &TransferId) -> [u8; 23] {
    let mut aad = [0u8; 23];
    aad[..16].copy_from_slice(transfer_id.as_bytes());
    aad[16..].copy_from_slice(CONTROL_LABEL);
    aad
}

/// Encrypt a control message for the peer.
pub fn seal_control(
    ratchet: &mut RatchetSession,
    transfer_id: &TransferId,
    message: &ControlMessage,
) -> Result<HandshakeMessage, TransferError> {
    let json = serde_json::to_vec(message)
        .map_err(|e| TransferError::Protocol(format!("control message: {}", e)))?;
    let (ciphertext, header) = ratchet.encrypt(&json, &control_aad(transfer_id))?;
    Ok(HandshakeMessage::Sealed {
        header: BASE64.encode(header.to_bytes()),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypt a `Sealed` message. Anything else is refused: once keys exist,
/// cleartext control messages carry no authority.
pub fn open_control(
    ratchet: &mut RatchetSession,
    transfer_id: &TransferId,
    message: &HandshakeMessage,
) -> Result<ControlMessage, TransferError> {
    let HandshakeMessage::Sealed { header, ciphertext } = message else {
        return Err(TransferError::Protocol(format!(
            "cleartext {} after the handshake",
            message.name()
        )));
    };
    let header = BASE64
        .decode(header)
        .ok()
        .and_then(|b| RatchetHeader::from_bytes(&b).ok())
        .ok_or_else(|| TransferError::Protocol("sealed header is malformed".into()))?;
    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|_| TransferError::Protocol("sealed body is not base64".into()))?;
    let plaintext = ratchet.decrypt(&header, &ciphertext, &control_aad(transfer_id))?;
    serde_json::from_slice(&plaintext)
        .map_err(|_| TransferError::Protocol("sealed control message is malformed".into()))
}

/// The bytes an Ack/Nack tag covers, kept until the session can check them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAuth {
    signed: Bytes,
    tag: [u8; CONTROL_TAG_LEN],
}

impl FrameAuth {
    pub fn verify(&self, ratchet: &RatchetSession) -> bool {
        ratchet.verify_control_tag(&self.signed, &self.tag)
    }
}

/// Decoded frame. Ack and Nack contents are untrusted until
/// `auth.verify` passes.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake {
        transfer_id: TransferId,
        message: HandshakeMessage,
    },
    Data {
        transfer_id: TransferId,
        sequence: u32,
        header: RatchetHeader,
        ciphertext: Bytes,
    },
    Ack {
        transfer_id: TransferId,
        cumulative: u32,
        ranges: RangeSet,
        announce: Announcement,
        auth: FrameAuth,
    },
    Nack {
        transfer_id: TransferId,
        first: u32,
        ranges: RangeSet,
        announce: Announcement,
        auth: FrameAuth,
    },
}

impl Frame {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Self::Handshake { transfer_id, .. }
            | Self::Data { transfer_id, .. }
            | Self::Ack { transfer_id, .. }
            | Self::Nack { transfer_id, .. } => *transfer_id,
        }
    }
}

fn put_header(buf: &mut BytesMut, frame_type: FrameType, transfer_id: &TransferId) {
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(frame_type as u8);
    buf.put_slice(transfer_id.as_bytes());
}

pub fn encode_handshake(transfer_id: &TransferId, message: &HandshakeMessage) -> Bytes {
    let json = serde_json::to_vec(message).expect("handshake messages always serialize");
    let mut buf = BytesMut::with_capacity(FRAME_HEADER + json.len());
    put_header(&mut buf, FrameType::Handshake, transfer_id);
    buf.put_slice(&json);
    buf.freeze()
}

pub fn encode_data(
    transfer_id: &TransferId,
    sequence: u32,
    header: &RatchetHeader,
    ciphertext: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_HEADER + ciphertext.len());
    put_header(&mut buf, FrameType::Data, transfer_id);
    buf.put_u32(sequence);
    buf.put_slice(&header.to_bytes());
    buf.put_slice(ciphertext);
    buf.freeze()
}

/// Ack for everything in `acked` (capped at `MAX_WIRE_RANGES`), tagged
/// and carrying the receiver's current ratchet announcement.
pub fn encode_ack(
    transfer_id: &TransferId,
    acked: &RangeSet,
    ratchet: &RatchetSession,
) -> Result<Bytes, TransferError> {
    encode_ranges(FrameType::Ack, transfer_id, acked.contiguous_prefix(), acked, ratchet)
}

/// Retransmission request for every chunk in `missing`.
pub fn encode_nack(
    transfer_id: &TransferId,
    missing: &RangeSet,
    ratchet: &RatchetSession,
) -> Result<Bytes, TransferError> {
    let first = missing.ranges().first().map(|&(s, _)| s).unwrap_or(0);
    encode_ranges(FrameType::Nack, transfer_id, first, missing, ratchet)
}

fn encode_ranges(
    frame_type: FrameType,
    transfer_id: &TransferId,
    sequence: u32,
    ranges: &RangeSet,
    ratchet: &RatchetSession,
) -> Result<Bytes, TransferError> {
    let ranges = ranges.truncated(MAX_WIRE_RANGES);
    let announce = ratchet.announcement();
    let mut buf =
        BytesMut::with_capacity(RANGE_HEADER + ranges.range_count() * 8 + CONTROL_TAG_LEN);
    put_header(&mut buf, frame_type, transfer_id);
    buf.put_u32(sequence);
    buf.put_u32(announce.epoch);
    buf.put_slice(&announce.ratchet_public);
    buf.put_u16(ranges.range_count() as u16);
    for &(start, end) in ranges.ranges() {
        buf.put_u32(start);
        buf.put_u32(end);
    }
    let tag = ratchet.control_tag(&buf)?;
    buf.put_slice(&tag);
    Ok(buf.freeze())
}

/// Associated data bound into every chunk's AEAD tag: transfer id and
/// sequence, so a ciphertext cannot be replayed under another position.
pub fn data_aad(transfer_id: &TransferId, sequence: u32) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(transfer_id.as_bytes());
    aad[16..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// Decode a frame. Returns None if it is truncated, has an unknown version
/// or type, or its body does not match its declared shape.
pub fn decode_frame(data: &Bytes) -> Option<Frame> {
    if data.len() < FRAME_HEADER || data[0] != PROTOCOL_VERSION {
        return None;
    }
    let frame_type = FrameType::from_u8(data[1])?;
    let transfer_id = TransferId::from_bytes(data[2..18].try_into().unwrap());

    match frame_type {
        FrameType::Handshake => {
            let message = serde_json::from_slice(&data[FRAME_HEADER..]).ok()?;
            Some(Frame::Handshake {
                transfer_id,
                message,
            })
        }
        FrameType::Data => {
            if data.len() < DATA_HEADER {
                return None;
            }
            let sequence = u32::from_be_bytes(data[18..22].try_into().unwrap());
            let header = RatchetHeader::from_bytes(&data[22..DATA_HEADER]).ok()?;
            Some(Frame::Data {
                transfer_id,
                sequence,
                header,
                ciphertext: data.slice(DATA_HEADER..),
            })
        }
        FrameType::Ack | FrameType::Nack => {
            if data.len() < RANGE_HEADER + CONTROL_TAG_LEN {
                return None;
            }
            let sequence = u32::from_be_bytes(data[18..22].try_into().unwrap());
            let announce = Announcement {
                epoch: u32::from_be_bytes(data[22..26].try_into().unwrap()),
                ratchet_public: data[26..58].try_into().unwrap(),
            };
            let count = u16::from_be_bytes(data[58..60].try_into().unwrap()) as usize;
            let signed_len = RANGE_HEADER + count * 8;
            if data.len() != signed_len + CONTROL_TAG_LEN {
                return None;
            }
            let mut ranges = RangeSet::new();
            for i in 0..count {
                let at = RANGE_HEADER + i * 8;
                let start = u32::from_be_bytes(data[at..at + 4].try_into().unwrap());
                let end = u32::from_be_bytes(data[at + 4..at + 8].try_into().unwrap());
                if start >= end {
                    return None;
                }
                ranges.insert_range(start, end);
            }
            let auth = FrameAuth {
                signed: data.slice(..signed_len),
                tag: data[signed_len..].try_into().unwrap(),
            };
            Some(if frame_type == FrameType::Ack {
                Frame::Ack {
                    transfer_id,
                    cumulative: sequence,
                    ranges,
                    announce,
                    auth,
                }
            } else {
                Frame::Nack {
                    transfer_id,
                    first: sequence,
                    ranges,
                    announce,
                    auth,
                }
            })
        }
    }
}
