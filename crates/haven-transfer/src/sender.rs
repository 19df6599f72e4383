/// Sending half of a transfer session.
///
/// ```text
/// Sender                                             Receiver
///   |--- Offer(eph key, kem ct, tag_i) ---------------->|
///   |<-- Accept(ratchet key, tag_r) --------------------|
///   |=== Manifest(file, chunk size, count) ============>|
///   |<== Resume(held ranges) ===========================|
///   |--- Data(seq, ratchet header, ciphertext) x window->|
///   |<-- Ack / Nack (ranges, announcement, MAC) --------|
///   |        ... until every chunk is acknowledged ...  |
///   |<== Complete(content hash) ========================|
///
///   === sealed with the session ratchet
/// ```
///
/// Up to `max_in_flight` chunks are outstanding. Retransmissions go first,
/// then the lowest chunk not yet sent or acknowledged. Each send is a fresh
/// ratchet encryption, so a retransmitted chunk never reuses a ciphertext.
/// Acks whose tag does not verify are dropped before they touch progress.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use haven_crypto::{HybridKeyPair, HybridPublicKey, RatchetSession};
use haven_types::{RangeSet, TransferId, TransferStatus};
use tokio::time::Instant;
use tracing::debug;

use crate::channel::ChannelWriter;
use crate::chunk::{self, ChunkStore};
use crate::error::TransferError;
use crate::logging::TransferEvent;
use crate::protocol::{self, ControlMessage, Frame, HandshakeMessage, Manifest};
use crate::session::{self, ConnectionEnd, Next, PeerLink, SessionCore, SessionState};

struct InFlight {
    deadline: Instant,
}

pub(crate) struct Sender {
    transfer_id: TransferId,
    source: Arc<ChunkStore>,
    ratchet: Option<RatchetSession>,
    retransmits: u64,
    started: Option<Instant>,
}

impl Sender {
    pub(crate) fn new(transfer_id: TransferId, source: Arc<ChunkStore>) -> Self {
        Self {
            transfer_id,
            source,
            ratchet: None,
            retransmits: 0,
            started: None,
        }
    }

    pub(crate) fn transfer_id(&self) -> TransferId {
        self.transfer_id
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
        let remote_key = link.remote_key.clone().ok_or_else(|| {
            TransferError::Protocol(format!("no public key known for peer {}", link.peer))
        })?;
        let writer = ChannelWriter::new(
            link.transport.channel.clone(),
            core.config.high_water,
            core.config.low_water,
        );

        let deadline = Instant::now() + core.config.handshake_timeout;
        let Some(mut ratchet) = self.exchange_keys(core, link, &writer, &remote_key, deadline).await?
        else {
            return Ok(ConnectionEnd::Paused);
        };
        let result = match self.negotiate(core, link, &writer, &mut ratchet, deadline).await {
            Ok(true) => self.transfer(core, link, &writer, &mut ratchet).await,
            Ok(false) => Ok(ConnectionEnd::Paused),
            Err(e) => Err(e),
        };
        // Kept until the session loop has sent its last word.
        self.ratchet = Some(ratchet);
        result
    }

    /// Offer / Accept exchange. Returns None if paused before it finished.
    async fn exchange_keys(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        remote_key: &HybridPublicKey,
        deadline: Instant,
    ) -> Result<Option<RatchetSession>, TransferError> {
        // Fresh ephemeral keys for every connection.
        let ephemeral = HybridKeyPair::generate();
        let (offer, pending) =
            haven_crypto::initiate(&ephemeral, remote_key, self.transfer_id.as_bytes())?;
        writer.write_now(protocol::encode_handshake(
            &self.transfer_id,
            &HandshakeMessage::offer(&offer),
        ))?;

        let response = loop {
            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Handshake { message, .. }) => match message {
                    HandshakeMessage::Accept { .. } => break protocol::parse_accept(&message)?,
                    HandshakeMessage::Reject { reason } => {
                        return Err(TransferError::Rejected(reason));
                    }
                    other => debug!(message = other.name(), "ignored while handshaking"),
                },
                Next::Frame(_) => {}
                Next::Deadline => return Err(TransferError::Timeout("handshake")),
                Next::Pause => return Ok(None),
            }
        };

        let keys = pending.finish(&response)?;
        Ok(Some(RatchetSession::new(keys, core.config.ratchet.clone())))
    }

    /// Sealed Manifest out, sealed Resume back. Returns false if paused.
    async fn negotiate(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
        deadline: Instant,
    ) -> Result<bool, TransferError> {
        let manifest = Manifest::new(self.source.metadata(), self.source.chunk_size());
        session::send_control(
            writer,
            ratchet,
            &self.transfer_id,
            &ControlMessage::Manifest(manifest),
        )?;

        let held = loop {
            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Handshake { message, .. }) => {
                    match core.open_control(ratchet, &self.transfer_id, &message) {
                        Some(ControlMessage::Resume { acked }) => break acked,
                        Some(ControlMessage::Reject { reason }) => {
                            return Err(TransferError::Rejected(reason));
                        }
                        Some(ControlMessage::Abort { reason }) => {
                            return Err(TransferError::Aborted(reason));
                        }
                        Some(ControlMessage::Cancel { .. }) => return Err(TransferError::Cancelled),
                        Some(other) => debug!(message = other.name(), "ignored while handshaking"),
                        None => {}
                    }
                }
                Next::Frame(_) => {}
                Next::Deadline => return Err(TransferError::Timeout("handshake")),
                Next::Pause => return Ok(false),
            }
        };

        let held = held.intersection(&RangeSet::full(self.source.chunk_count()));
        core.merge_acked(&held);
        core.transition(TransferStatus::Active)?;
        core.set_state(SessionState::Sending);
        core.log(TransferEvent::HandshakeComplete {
            resumed_chunks: core.acked().len(),
        });
        Ok(true)
    }

    async fn transfer(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
    ) -> Result<ConnectionEnd, TransferError> {
        let config = core.config.clone();
        let total = self.source.chunk_count();
        let everything = RangeSet::full(total);
        let started = *self.started.get_or_insert_with(Instant::now);

        // Retransmission budgets restart with every connection.
        let mut attempts: HashMap<u32, u32> = HashMap::new();
        let mut in_flight: HashMap<u32, InFlight> = HashMap::new();
        let mut retransmit: BTreeSet<u32> = BTreeSet::new();
        let mut cursor = 0u32;
        let mut last_heard = Instant::now();
        let mut verdict_deadline: Option<Instant> = None;

        loop {
            if verdict_deadline.is_none() && core.all_acked() {
                debug!(transfer_id = %self.transfer_id, "all chunks acknowledged, awaiting verdict");
                verdict_deadline = Some(Instant::now() + config.completion_timeout);
                in_flight.clear();
                retransmit.clear();
            }

            if verdict_deadline.is_none() {
                let acked = core.acked();
                while in_flight.len() < config.max_in_flight {
                    let Some(sequence) =
                        next_to_send(&acked, &in_flight, &mut retransmit, &mut cursor, total)
                    else {
                        break;
                    };
                    let attempt = attempts.entry(sequence).or_insert(0);
                    *attempt += 1;
                    let attempt = *attempt;
                    if attempt > config.max_retries + 1 {
                        return Err(TransferError::RetryBudgetExhausted {
                            sequence,
                            attempts: attempt - 1,
                        });
                    }
                    self.send_chunk(core, writer, ratchet, sequence, attempt).await?;
                    in_flight.insert(
                        sequence,
                        InFlight {
                            deadline: Instant::now() + config.backoff(attempt),
                        },
                    );
                }
            }

            let mut deadline = last_heard + config.inactivity_timeout;
            if let Some(verdict) = verdict_deadline {
                deadline = deadline.min(verdict);
            }
            if let Some(first) = in_flight.values().map(|f| f.deadline).min() {
                deadline = deadline.min(first);
            }

            match core.next_frame(&mut link.transport.incoming, deadline).await? {
                Next::Frame(Frame::Ack {
                    cumulative,
                    ranges,
                    announce,
                    auth,
                    ..
                }) => {
                    if !core.verify_frame(ratchet, "ack", &auth) {
                        continue;
                    }
                    last_heard = Instant::now();
                    ratchet.observe_remote(&announce);
                    let mut got = ranges;
                    got.insert_range(0, cumulative);
                    let got = got.intersection(&everything);

                    in_flight.retain(|sequence, _| !got.contains(*sequence));
                    retransmit.retain(|sequence| !got.contains(*sequence));
                    // Persist before anything new goes out.
                    if core.merge_acked(&got) {
                        core.persist()?;
                    }
                    core.log(TransferEvent::AckReceived {
                        cumulative,
                        acked: core.acked().len(),
                    });
                }
                Next::Frame(Frame::Nack {
                    first,
                    ranges,
                    announce,
                    auth,
                    ..
                }) => {
                    if !core.verify_frame(ratchet, "nack", &auth) {
                        continue;
                    }
                    last_heard = Instant::now();
                    ratchet.observe_remote(&announce);
                    let mut wanted = ranges;
                    wanted.insert(first);
                    let wanted = wanted.intersection(&everything);
                    core.log(TransferEvent::NackReceived {
                        first,
                        missing: wanted.len(),
                    });
                    if verdict_deadline.is_none() {
                        for sequence in wanted.iter() {
                            if !core.is_acked(sequence) {
                                in_flight.remove(&sequence);
                                retransmit.insert(sequence);
                            }
                        }
                    }
                }
                Next::Frame(Frame::Handshake { message, .. }) => match core.open_control(
                    ratchet,
                    &self.transfer_id,
                    &message,
                ) {
                    Some(ControlMessage::Complete { content_hash }) => {
                        let expected = &self.source.metadata().content_hash;
                        if &content_hash != expected {
                            return Err(TransferError::ContentHashMismatch {
                                expected: expected.clone(),
                                actual: content_hash,
                            });
                        }
                        // The receiver verified the whole file, so every chunk arrived.
                        if core.merge_acked(&everything) {
                            core.persist()?;
                        }
                        core.log(TransferEvent::TransferComplete {
                            total_bytes: self.source.metadata().size,
                            duration_ms: started.elapsed().as_millis() as u64,
                            retransmits: self.retransmits,
                        });
                        return Ok(ConnectionEnd::Completed);
                    }
                    Some(ControlMessage::Abort { reason }) => {
                        return Err(TransferError::Aborted(reason));
                    }
                    Some(ControlMessage::Cancel { .. }) => return Err(TransferError::Cancelled),
                    Some(ControlMessage::Reject { reason }) => {
                        return Err(TransferError::Rejected(reason));
                    }
                    Some(other) => debug!(message = other.name(), "ignored while sending"),
                    None => {}
                },
                Next::Frame(Frame::Data { .. }) => {}
                Next::Deadline => {
                    let now = Instant::now();
                    if now >= last_heard + config.inactivity_timeout {
                        return Err(TransferError::Timeout("peer inactivity"));
                    }
                    if verdict_deadline.is_some_and(|v| now >= v) {
                        return Err(TransferError::Timeout("completion verdict"));
                    }
                    in_flight.retain(|sequence, sent| {
                        if sent.deadline <= now {
                            retransmit.insert(*sequence);
                            false
                        } else {
                            true
                        }
                    });
                }
                Next::Pause => return Ok(ConnectionEnd::Paused),
            }
        }
    }

    /// Encrypt and write one chunk.
    async fn send_chunk(
        &mut self,
        core: &SessionCore,
        writer: &ChannelWriter,
        ratchet: &mut RatchetSession,
        sequence: u32,
        attempt: u32,
    ) -> Result<(), TransferError> {
        let chunk = self.source.chunk(self.transfer_id, sequence).ok_or_else(|| {
            TransferError::Protocol(format!("chunk {} is outside the file", sequence))
        })?;
        let body = chunk::seal_body(&chunk);

        let epoch_before = ratchet.sending_epoch();
        let (ciphertext, header) =
            ratchet.encrypt(&body, &protocol::data_aad(&self.transfer_id, sequence))?;
        if header.epoch != epoch_before {
            core.log(TransferEvent::RatchetTurned { epoch: header.epoch });
        }

        let frame = protocol::encode_data(&self.transfer_id, sequence, &header, &ciphertext);
        tokio::select! {
            biased;
            _ = core.cancel.cancelled() => return Err(TransferError::Cancelled),
            written = writer.write(frame) => written?,
        }

        if attempt > 1 {
            self.retransmits += 1;
            core.set_retransmits(self.retransmits);
            core.log(TransferEvent::ChunkRetransmitted { sequence, attempt });
        } else {
            core.log(TransferEvent::ChunkSent {
                sequence,
                epoch: header.epoch,
                size: chunk.payload.len(),
            });
        }
        Ok(())
    }
}

/// Queued retransmissions first, then the lowest chunk that is neither
/// acknowledged nor outstanding.
fn next_to_send(
    acked: &RangeSet,
    in_flight: &HashMap<u32, InFlight>,
    retransmit: &mut BTreeSet<u32>,
    cursor: &mut u32,
    total: u32,
) -> Option<u32> {
    while let Some(sequence) = retransmit.pop_first() {
        if !acked.contains(sequence) {
            return Some(sequence);
        }
    }
    while *cursor < total {
        let sequence = *cursor;
        *cursor += 1;
        if !acked.contains(sequence) && !in_flight.contains_key(&sequence) {
            return Some(sequence);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_to_send_prefers_retransmissions() {
        let acked = RangeSet::from(vec![(0, 2)]);
        let mut in_flight = HashMap::new();
        in_flight.insert(
            2,
            InFlight {
                deadline: Instant::now(),
            },
        );
        let mut retransmit: BTreeSet<u32> = [1, 5].into_iter().collect();
        let mut cursor = 0;

        // 1 is already acknowledged and skipped.
        assert_eq!(next_to_send(&acked, &in_flight, &mut retransmit, &mut cursor, 6), Some(5));
        in_flight.insert(
            5,
            InFlight {
                deadline: Instant::now(),
            },
        );
        // 0 and 1 acknowledged, 2 and 5 outstanding.
        assert_eq!(next_to_send(&acked, &in_flight, &mut retransmit, &mut cursor, 6), Some(3));
        assert_eq!(next_to_send(&acked, &in_flight, &mut retransmit, &mut cursor, 6), Some(4));
        assert_eq!(next_to_send(&acked, &in_flight, &mut retransmit, &mut cursor, 6), None);
    }
}
