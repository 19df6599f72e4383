/// Receiving half of a transfer session.
///
/// Every decrypted chunk is checked, written at its offset, recorded, and
/// only then acknowledged. Acks carry the full coalesced range list, so a
/// lost Ack is repaired by the next one. Every Ack and Nack is tagged with
/// the session control key and announces the key for the sender's next
/// ratchet turn.
///
/// ```text
/// decrypt ok, tag ok    -> write, persist, Ack(ranges)
/// already held          -> Ack(ranges) again, nothing written
/// replayed              -> dropped
/// auth/integrity failed -> Nack(that sequence)
/// gap below highest     -> Nack(gap), at most once per ack_timeout per chunk
/// ```

use std::collections::HashMap;
use std::sync::Arc;

use haven_crypto::{HandshakeOffer, HybridKeyPair, RatchetError, RatchetSession};
use haven_types::{
    Direction, RangeSet, SessionKind, TransferId, TransferRecord, TransferStatus,
    checked_chunk_count,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::ChannelWriter;
use crate::chunk::{self, ReceiveTarget, Reassembler};
use crate::config::{MAX_CHUNK_SIZE, TransferConfig};
use crate::error::{ChunkError, TransferError};
use crate::logging::TransferEvent;
use crate::protocol::{self, ControlMessage, Frame, HandshakeMessage, Manifest};
use crate::session::{self, ConnectionEnd, Next, PeerLink, SessionCore, SessionState};

/// Upper bound on chunks requested by one gap scan.
const MAX_SCAN_REQUEST: usize = 4096;

pub(crate) struct Receiver {
    identity: Arc<HybridKeyPair>,
    target: ReceiveTarget,
    expected: Option<TransferId>,
    reassembler: Option<Reassembler>,
    ratchet: Option<RatchetSession>,
    started: Option<Instant>,
}

impl Receiver {
    pub(crate) fn new(
        identity: Arc<HybridKeyPair>,
        target: ReceiveTarget,
        expected: Option<TransferId>,
    ) -> Self {
        Self {
            identity,
            target,
            expected,
            reassembler: None,
            ratchet: None,
            started: None,
        }
    }

    pub(crate) fn transfer_id(&self) -> Option<TransferId> {
        self.expected
    }

    pub(crate) fn ratchet_mut(&mut self) -> Option<&mut RatchetSession> {
        self.ratchet.as_mut()
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(mut ratchet) = self.ratchet.take() {
            ratchet.wipe();
        }
    }

    pub(crate) async fn connect(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
    ) -> Result<ConnectionEnd, TransferError> {
        let writer = ChannelWriter::new(
            link.transport.channel.clone(),
            core.config.high_water,
            core.config.low_water,
        );

        let deadline = Instant::now() + core.config.handshake_timeout;
        let Some((transfer_id, offer)) = self.await_offer(core, link, &writer, deadline).await? else {
            return Ok(ConnectionEnd::Paused);
        };
        // No session keys yet, so refusals go out in the clear.
        let reject = |reason: &str| {
            let _ = writer.write_now(protocol::encode_handshake(
                &transfer_id,
                &HandshakeMessage::Reject {
                    reason: reason.to_string(),
                },
            ));
        };

        let stored = match core.record().cloned() {
            Some(record) => Some(record),
            None => core.load(transfer_id)?,
        };
        if let Some(record) = stored {
            if record.direction != Direction::Receive {
                reject("offer does not match the stored transfer");
                return Err(TransferError::Protocol(format!(
                    "offer for {} does not match the stored transfer",
                    transfer_id
                )));
            }
            if record.peer != link.peer {
                reject("transfer belongs to another peer");
                return Err(TransferError::Protocol(format!(
                    "transfer {} belongs to peer {}",
                    transfer_id, record.peer
                )));
            }
            if matches!(record.status, TransferStatus::Failed | TransferStatus::Cancelled) {
                reject("transfer already ended");
                return Err(TransferError::Protocol(format!(
                    "transfer {} already {}",
                    transfer_id, record.status
                )));
            }
            core.adopt(record);
        }
        self.expected = Some(transfer_id);

        let (keys, response) =
            match haven_crypto::agree(&self.identity, &offer, transfer_id.as_bytes()) {
                Ok(agreed) => agreed,
                Err(e) => {
                    reject(&e.to_string());
                    return Err(e.into());
                }
            };
        let mut ratchet = RatchetSession::new(keys, core.config.ratchet.clone());
        writer.write_now(protocol::encode_handshake(
            &transfer_id,
            &HandshakeMessage::accept(&response),
        ))?;

        let result = self
            .serve(core, link, &writer, &mut ratchet, transfer_id, deadline)
            .await;
        // Kept until the session loop has sent its last word.
        self.ratchet = Some(ratchet);
        result
    }

    /// Everything after the key exchange: manifest, resume point, chunks.
    async fn serve(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
        transfer_id: TransferId,
        deadline: Instant,
    ) -> Result<ConnectionEnd, TransferError> {
        let Some(manifest) = self
            .await_manifest(core, link, ratchet, transfer_id, deadline)
            .await?
        else {
            return Ok(ConnectionEnd::Paused);
        };
        let refuse = |ratchet: &mut RatchetSession, reason: String| {
            let _ = session::send_control(
                writer,
                ratchet,
                &transfer_id,
                &ControlMessage::Reject {
                    reason: reason.clone(),
                },
            );
            TransferError::Protocol(reason)
        };

        if let Err(reason) = validate_manifest(&manifest, &core.config, &self.target) {
            return Err(refuse(ratchet, reason));
        }

        match core.record() {
            Some(record) => {
                if record.file != manifest.file || record.chunk_size != manifest.chunk_size {
                    return Err(refuse(
                        ratchet,
                        "manifest does not match the stored transfer".into(),
                    ));
                }
            }
            None => core.adopt(TransferRecord::new(
                transfer_id,
                link.peer.clone(),
                Direction::Receive,
                SessionKind::Single,
                manifest.file.clone(),
                manifest.chunk_size,
            )),
        }

        // Already finished on an earlier connection: tell the sender again.
        if core.record().is_some_and(|r| r.status == TransferStatus::Completed) {
            session::send_control(
                writer,
                ratchet,
                &transfer_id,
                &ControlMessage::resume(&RangeSet::full(manifest.chunk_count)),
            )?;
            session::send_control(
                writer,
                ratchet,
                &transfer_id,
                &ControlMessage::Complete {
                    content_hash: manifest.file.content_hash.clone(),
                },
            )?;
            return Ok(ConnectionEnd::Completed);
        }

        if self.reassembler.is_none() {
            self.reassembler = Some(
                Reassembler::open(&self.target, transfer_id, manifest.file.clone(), manifest.chunk_size)
                    .await?,
            );
        }

        session::send_control(writer, ratchet, &transfer_id, &ControlMessage::resume(&core.acked()))?;
        core.transition(TransferStatus::Active)?;
        core.set_state(SessionState::Receiving);
        core.log(TransferEvent::HandshakeComplete {
            resumed_chunks: core.acked().len(),
        });

        self.receive(core, link, writer, ratchet, transfer_id, &manifest)
            .await
    }

    async fn await_offer(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        deadline: Instant,
    ) -> Result<Option<(TransferId, HandshakeOffer)>, TransferError> {
        loop {
            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Handshake {
                    transfer_id,
                    message,
                }) => {
                    if self.expected.is_some_and(|e| e != transfer_id) {
                        core.log(TransferEvent::TransferIdMismatch { got: transfer_id });
                        if matches!(message, HandshakeMessage::Offer { .. }) {
                            let _ = writer.write_now(protocol::encode_handshake(
                                &transfer_id,
                                &HandshakeMessage::Reject {
                                    reason: "unexpected transfer".into(),
                                },
                            ));
                        }
                        continue;
                    }
                    match message {
                        HandshakeMessage::Offer { .. } => {
                            return Ok(Some((transfer_id, protocol::parse_offer(&message)?)));
                        }
                        HandshakeMessage::Reject { reason } => {
                            return Err(TransferError::Rejected(reason));
                        }
                        other => debug!(message = other.name(), "ignored while waiting for an offer"),
                    }
                }
                Next::Frame(_) => {}
                Next::Deadline => return Err(TransferError::Timeout("handshake")),
                Next::Pause => return Ok(None),
            }
        }
    }

    async fn await_manifest(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        ratchet: &mut RatchetSession,
        transfer_id: TransferId,
        deadline: Instant,
    ) -> Result<Option<Manifest>, TransferError> {
        loop {
            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Handshake { message, .. }) => {
                    match core.open_control(ratchet, &transfer_id, &message) {
                        Some(ControlMessage::Manifest(manifest)) => return Ok(Some(manifest)),
                        Some(ControlMessage::Cancel { .. }) => return Err(TransferError::Cancelled),
                        Some(ControlMessage::Abort { reason }) => {
                            return Err(TransferError::Aborted(reason));
                        }
                        Some(ControlMessage::Reject { reason }) => {
                            return Err(TransferError::Rejected(reason));
                        }
                        Some(other) => debug!(message = other.name(), "ignored while waiting for a manifest"),
                        None => {}
                    }
                }
                Next::Frame(_) => {}
                Next::Deadline => return Err(TransferError::Timeout("handshake")),
                Next::Pause => return Ok(None),
            }
        }
    }

    async fn receive(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
        transfer_id: TransferId,
        manifest: &Manifest,
    ) -> Result<ConnectionEnd, TransferError> {
        let config = core.config.clone();
        let total = manifest.chunk_count;
        let started = *self.started.get_or_insert_with(Instant::now);

        let mut highest: Option<u32> = core.acked().ranges().last().map(|&(_, end)| end - 1);
        let mut last_nack: HashMap<u32, Instant> = HashMap::new();
        let mut last_heard = Instant::now();
        let mut next_scan = last_heard + config.nack_interval;

        loop {
            if core.all_acked() {
                return self
                    .complete(core, writer, ratchet, transfer_id, manifest, started)
                    .await;
            }

            let deadline = next_scan.min(last_heard + config.inactivity_timeout);
            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Data {
                    sequence,
                    header,
                    ciphertext,
                    ..
                }) => {
                    last_heard = Instant::now();
                    if sequence >= total {
                        warn!(transfer_id = %transfer_id, sequence, total, "chunk beyond end of file dropped");
                        continue;
                    }
                    if core.is_acked(sequence) {
                        // Duplicate: acknowledge again, never rewrite.
                        send_ack(core, writer, ratchet, transfer_id);
                        continue;
                    }

                    let aad = protocol::data_aad(&transfer_id, sequence);
                    let body = match ratchet.decrypt(&header, &ciphertext, &aad) {
                        Ok(body) => body,
                        Err(RatchetError::Replay { .. }) => {
                            debug!(transfer_id = %transfer_id, sequence, "replayed chunk dropped");
                            continue;
                        }
                        Err(
                            e @ (RatchetError::Authentication { .. }
                            | RatchetError::TooFarAhead { .. }
                            | RatchetError::MalformedHeader),
                        ) => {
                            self.refuse(core, writer, ratchet, transfer_id, sequence, e.to_string(), &mut last_nack);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };

                    let chunk = match chunk::open_body(transfer_id, sequence, &body) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.refuse(core, writer, ratchet, transfer_id, sequence, e.to_string(), &mut last_nack);
                            continue;
                        }
                    };
                    let reassembler = self
                        .reassembler
                        .as_mut()
                        .ok_or_else(|| TransferError::Protocol("no open reassembler".into()))?;
                    match reassembler.write(sequence, &chunk.payload).await {
                        Ok(()) => {}
                        Err(TransferError::Chunk(e @ ChunkError::Integrity { .. })) => {
                            self.refuse(core, writer, ratchet, transfer_id, sequence, e.to_string(), &mut last_nack);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }

                    core.mark_acked(sequence);
                    core.persist()?;
                    send_ack(core, writer, ratchet, transfer_id);
                    last_nack.remove(&sequence);
                    highest = Some(highest.map_or(sequence, |h| h.max(sequence)));
                }
                Next::Frame(Frame::Handshake { message, .. }) => {
                    match core.open_control(ratchet, &transfer_id, &message) {
                        Some(ControlMessage::Cancel { .. }) => return Err(TransferError::Cancelled),
                        Some(ControlMessage::Abort { reason }) => {
                            return Err(TransferError::Aborted(reason));
                        }
                        Some(other) => debug!(message = other.name(), "ignored while receiving"),
                        None => {}
                    }
                }
                Next::Frame(_) => {}
                Next::Deadline => {
                    let now = Instant::now();
                    if now >= last_heard + config.inactivity_timeout {
                        return Err(TransferError::Timeout("peer inactivity"));
                    }
                    if now >= next_scan {
                        if let Some(top) = highest {
                            self.scan_gaps(core, writer, ratchet, transfer_id, top, &mut last_nack);
                        }
                        next_scan = now + config.nack_interval;
                    }
                }
                Next::Pause => return Ok(ConnectionEnd::Paused),
            }
        }
    }

    /// NACK one chunk right away after it failed authentication or integrity.
    #[allow(clippy::too_many_arguments)]
    fn refuse(
        &self,
        core: &SessionCore,
        writer: &ChannelWriter,
        ratchet: &RatchetSession,
        transfer_id: TransferId,
        sequence: u32,
        reason: String,
        last_nack: &mut HashMap<u32, Instant>,
    ) {
        core.log(TransferEvent::ChunkRejected { sequence, reason });
        let mut missing = RangeSet::new();
        missing.insert(sequence);
        send_nack(core, writer, ratchet, transfer_id, &missing);
        last_nack.insert(sequence, Instant::now());
    }

    /// Request chunks missing below the highest one received, skipping any
    /// requested less than one ack timeout ago.
    fn scan_gaps(
        &self,
        core: &SessionCore,
        writer: &ChannelWriter,
        ratchet: &RatchetSession,
        transfer_id: TransferId,
        highest: u32,
        last_nack: &mut HashMap<u32, Instant>,
    ) {
        let now = Instant::now();
        let hold_off = core.config.ack_timeout;
        let due: RangeSet = core
            .acked()
            .missing(highest)
            .iter()
            .filter(|seq| last_nack.get(seq).is_none_or(|at| now >= *at + hold_off))
            .take(MAX_SCAN_REQUEST)
            .collect();
        if due.is_empty() {
            return;
        }
        let sent = due.truncated(protocol::MAX_WIRE_RANGES);
        for sequence in sent.iter() {
            last_nack.insert(sequence, now);
        }
        send_nack(core, writer, ratchet, transfer_id, &sent);
    }

    async fn complete(
        &mut self,
        core: &mut SessionCore,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
        transfer_id: TransferId,
        manifest: &Manifest,
        started: Instant,
    ) -> Result<ConnectionEnd, TransferError> {
        let reassembler = self
            .reassembler
            .take()
            .ok_or_else(|| TransferError::Protocol("no open reassembler".into()))?;
        let output = reassembler.finish().await?;

        session::send_control(
            writer,
            ratchet,
            &transfer_id,
            &ControlMessage::Complete {
                content_hash: manifest.file.content_hash.clone(),
            },
        )?;
        core.set_output(output);
        core.log(TransferEvent::TransferComplete {
            total_bytes: manifest.file.size,
            duration_ms: started.elapsed().as_millis() as u64,
            retransmits: 0,
        });
        Ok(ConnectionEnd::Completed)
    }
}

/// Check a manifest before any file is opened for it.
fn validate_manifest(
    manifest: &Manifest,
    config: &TransferConfig,
    target: &ReceiveTarget,
) -> Result<(), String> {
    if manifest.chunk_size == 0 || manifest.chunk_size > MAX_CHUNK_SIZE {
        return Err(format!("chunk size {} out of range", manifest.chunk_size));
    }
    if checked_chunk_count(manifest.file.size, manifest.chunk_size) != Some(manifest.chunk_count) {
        return Err("chunk count does not match file size".into());
    }
    if manifest.file.size > config.max_file_size {
        return Err(format!(
            "file of {} bytes exceeds the {} byte limit",
            manifest.file.size, config.max_file_size
        ));
    }
    if matches!(target, ReceiveTarget::Memory) && manifest.file.size > config.max_memory_file_size {
        return Err(format!(
            "file of {} bytes is too large to receive into memory",
            manifest.file.size
        ));
    }
    let hash = &manifest.file.content_hash;
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("content hash is malformed".into());
    }
    Ok(())
}

/// Acks and Nacks skip the write buffer so they never wait behind data.
/// A failed send is harmless: the next Ack carries the same ranges.
fn send_ack(core: &SessionCore, writer: &ChannelWriter, ratchet: &RatchetSession, transfer_id: TransferId) {
    let sent = protocol::encode_ack(&transfer_id, &core.acked(), ratchet)
        .and_then(|frame| Ok(writer.write_now(frame)?));
    if let Err(e) = sent {
        debug!(transfer_id = %transfer_id, "ack not sent: {}", e);
    }
}

fn send_nack(
    core: &SessionCore,
    writer: &ChannelWriter,
    ratchet: &RatchetSession,
    transfer_id: TransferId,
    missing: &RangeSet,
) {
    let sent = protocol::encode_nack(&transfer_id, missing, ratchet)
        .and_then(|frame| Ok(writer.write_now(frame)?));
    match sent {
        Ok(()) => core.log(TransferEvent::NackSent {
            first: missing.ranges().first().map(|&(s, _)| s).unwrap_or(0),
            missing: missing.len(),
        }),
        Err(e) => debug!(transfer_id = %transfer_id, "nack not sent: {}", e),
    }
}
