use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use haven_crypto::HybridKeyPair;
use haven_db::TransferStore;
use haven_transfer::memory::{self, MemoryConfig};
use haven_transfer::protocol::{self, FrameType};
use haven_transfer::{
    ChunkStore, Frame, FrameAction, GroupConfig, GroupTransferController, HandshakeMessage,
    MemoryLogger, PeerLink, ReceiveTarget, ReceivedFile, SessionState, TransferConfig,
    TransferEvent, TransferSession, TransportHandle, decode_frame,
};
use haven_types::{Direction, PeerIdentity, RangeSet, SessionKind, TransferStatus};

struct Node {
    name: PeerIdentity,
    identity: Arc<HybridKeyPair>,
    store: Arc<TransferStore>,
    logger: Arc<MemoryLogger>,
    sessions: TransferSession,
}

impl Node {
    fn new(name: &str, config: TransferConfig) -> Self {
        let store = Arc::new(TransferStore::open_in_memory().unwrap());
        let logger = Arc::new(MemoryLogger::new());
        let sessions = TransferSession::new(config, store.clone(), logger.clone()).unwrap();
        Self {
            name: PeerIdentity::new(name),
            identity: Arc::new(HybridKeyPair::generate()),
            store,
            logger,
            sessions,
        }
    }

    /// Same identity and store, fresh session factory: a restarted process.
    fn restarted(&self, config: TransferConfig) -> TransferSession {
        TransferSession::new(config, self.store.clone(), self.logger.clone()).unwrap()
    }

    fn link_to(&self, receiver: &Node, transport: TransportHandle) -> PeerLink {
        PeerLink::outbound(receiver.name.clone(), receiver.identity.public_key(), transport)
    }

    fn link_from(&self, sender: &Node, transport: TransportHandle) -> PeerLink {
        PeerLink::inbound(sender.name.clone(), transport)
    }
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>().into()
}

fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::fill(data.as_mut_slice());
    data.into()
}

fn data_sequence(frame: &Bytes) -> Option<u32> {
    match decode_frame(frame)? {
        Frame::Data { sequence, .. } => Some(sequence),
        _ => None,
    }
}

/// Record the sequence of every data frame crossing a→b.
fn record_data(link: &memory::MemoryLink) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    link.set_filter_a_to_b(move |frame| {
        if let Some(sequence) = data_sequence(frame) {
            sink.lock().unwrap().push(sequence);
        }
        FrameAction::Deliver
    });
    seen
}

fn is_frame(frame: &Bytes, frame_type: FrameType) -> bool {
    frame.len() > 1 && frame[1] == frame_type as u8
}

/// An Ack claiming all `total` chunks, built on a real Ack's header but
/// carrying a tag nobody computed.
fn forge_full_ack(real: &Bytes, total: u32) -> Bytes {
    let mut forged = real[..protocol::RANGE_HEADER - 2].to_vec();
    forged[18..22].copy_from_slice(&total.to_be_bytes());
    forged.extend_from_slice(&1u16.to_be_bytes());
    forged.extend_from_slice(&0u32.to_be_bytes());
    forged.extend_from_slice(&total.to_be_bytes());
    forged.extend_from_slice(&[0u8; 32]);
    forged.into()
}

fn record_handshakes(sink: Arc<Mutex<Vec<Bytes>>>) -> impl FnMut(&Bytes) -> FrameAction + Send + 'static {
    move |frame| {
        if is_frame(frame, FrameType::Handshake) {
            sink.lock().unwrap().push(frame.clone());
        }
        FrameAction::Deliver
    }
}

fn frame_rejections(logger: &MemoryLogger, component: &str) -> Vec<&'static str> {
    logger
        .events(component)
        .into_iter()
        .filter_map(|e| match e {
            TransferEvent::FrameRejected { kind, .. } => Some(kind),
            _ => None,
        })
        .collect()
}

fn slow_link() -> MemoryConfig {
    MemoryConfig {
        drain_delay: Duration::from_millis(1),
        ..MemoryConfig::default()
    }
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("haven-transfer-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn test_single_transfer_delivers_identical_bytes() {
    let config = TransferConfig {
        chunk_size: 16 * 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = random_bytes(1024 * 1024 + 123);
    let source = Arc::new(ChunkStore::from_bytes("single.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, _link) = memory::pair();
    let send = alice
        .sessions
        .send(source.clone(), alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);
    let transfer_id = send.transfer_id().unwrap();

    let sent = send.wait().await;
    let received = recv.wait().await;

    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.state, SessionState::Completed);
    assert_eq!(received.status, TransferStatus::Completed);
    assert_eq!(received.transfer_id, Some(transfer_id));
    assert_eq!(received.output, Some(ReceivedFile::Memory(data)));
    assert_eq!(sent.retransmits, 0);

    let stored = alice.store.load_record(transfer_id).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Completed);
    assert!(stored.all_acked());
    assert_eq!(stored.chunk_count(), source.chunk_count());

    let stored = bob.store.load_record(transfer_id).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Completed);
    assert_eq!(stored.peer, alice.name);
}

#[tokio::test]
async fn test_empty_file_travels_as_one_chunk() {
    let alice = Node::new("alice", TransferConfig::default());
    let bob = Node::new("bob", TransferConfig::default());
    let source = Arc::new(ChunkStore::from_bytes("empty", Bytes::new(), 1024).unwrap());
    assert_eq!(source.chunk_count(), 1);

    let (a, b, _link) = memory::pair();
    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    assert_eq!(send.wait().await.status, TransferStatus::Completed);
    let received = recv.wait().await;
    assert_eq!(received.output, Some(ReceivedFile::Memory(Bytes::new())));
}

#[tokio::test]
async fn test_tampered_chunk_is_nacked_and_resent() {
    let config = TransferConfig {
        chunk_size: 4096,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(64 * 4096);
    let source = Arc::new(ChunkStore::from_bytes("tamper.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, link) = memory::pair();
    let mut tampered = false;
    link.set_filter_a_to_b(move |frame| {
        if !tampered && data_sequence(frame) == Some(42) {
            tampered = true;
            let mut bytes = frame.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            return FrameAction::Replace(Bytes::from(bytes));
        }
        FrameAction::Deliver
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(received.output, Some(ReceivedFile::Memory(data)));

    let events = bob.logger.events("receiver");
    let nacks: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::NackSent { .. }))
        .collect();
    assert_eq!(nacks, vec![&TransferEvent::NackSent { first: 42, missing: 1 }]);
    assert!(events
        .iter()
        .any(|e| matches!(e, TransferEvent::ChunkRejected { sequence: 42, .. })));

    let resent: Vec<_> = alice
        .logger
        .events("sender")
        .into_iter()
        .filter_map(|e| match e {
            TransferEvent::ChunkRetransmitted { sequence, .. } => Some(sequence),
            _ => None,
        })
        .collect();
    assert_eq!(resent, vec![42]);
}

#[tokio::test]
async fn test_duplicate_frames_change_nothing() {
    let config = TransferConfig {
        chunk_size: 2048,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(50 * 2048);
    let source = Arc::new(ChunkStore::from_bytes("dup.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, link) = memory::pair();
    link.set_filter_a_to_b(|frame| match data_sequence(frame) {
        Some(_) => FrameAction::Duplicate,
        None => FrameAction::Deliver,
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.retransmits, 0);
    assert_eq!(received.acked, RangeSet::full(50));
    assert_eq!(received.output, Some(ReceivedFile::Memory(data)));

    let events = bob.logger.events("receiver");
    assert!(!events.iter().any(|e| matches!(e, TransferEvent::ChunkRejected { .. })));
    assert!(!events.iter().any(|e| matches!(e, TransferEvent::NackSent { .. })));
}

#[tokio::test]
async fn test_ratchet_turns_during_transfer() {
    let mut config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    config.ratchet.turn_every_messages = 8;
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(96 * 1024);
    let source = Arc::new(ChunkStore::from_bytes("turns.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, _link) = memory::pair();
    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    assert_eq!(send.wait().await.status, TransferStatus::Completed);
    assert_eq!(recv.wait().await.output, Some(ReceivedFile::Memory(data)));

    let turns: Vec<u32> = alice
        .logger
        .events("sender")
        .into_iter()
        .filter_map(|e| match e {
            TransferEvent::RatchetTurned { epoch } => Some(epoch),
            _ => None,
        })
        .collect();
    assert!(turns.len() >= 2, "expected several turns, got {:?}", turns);
    assert!(turns.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn test_wrong_recipient_key_fails_handshake() {
    let alice = Node::new("alice", TransferConfig::default());
    let bob = Node::new("bob", TransferConfig::default());
    let source = Arc::new(ChunkStore::from_bytes("x", pattern(4096), 1024).unwrap());

    let (a, b, _link) = memory::pair();
    let stranger = HybridKeyPair::generate();
    let send = alice
        .sessions
        .send(
            source,
            PeerLink::outbound(bob.name.clone(), stranger.public_key(), a),
            SessionKind::Single,
        )
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Failed);
    assert!(sent.last_error.is_some());
    assert_eq!(received.status, TransferStatus::Failed);
    assert_eq!(received.output, None);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_never_resends_acknowledged_chunks() {
    let config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(200 * 1024);
    let source = Arc::new(ChunkStore::from_bytes("pause.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, _link) = memory::pair_with(slow_link());
    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);
    let sender = send.control();
    let receiver = recv.control();

    sender.wait_for(|s| s.acked_count() >= 20).await;
    assert!(sender.pause());
    assert!(sender.pause());
    let paused = sender.wait_for(|s| s.state == SessionState::Paused).await;
    let held = receiver.wait_for(|s| s.state == SessionState::Paused).await.acked;
    assert_eq!(paused.status, TransferStatus::Paused);
    assert!(paused.acked_count() < 200);

    // A repeated pause and a resume towards the wrong peer change nothing.
    assert!(sender.pause());
    let (stray, _other, _stray_link) = memory::pair();
    assert!(sender.resume(PeerLink::outbound(
        PeerIdentity::new("mallory"),
        bob.identity.public_key(),
        stray,
    )));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let still = sender.snapshot();
    assert_eq!(still.state, SessionState::Paused);
    assert_eq!(still.acked, paused.acked);
    let stored = alice.store.load_record(paused.transfer_id.unwrap()).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Paused);

    let (a2, b2, link2) = memory::pair();
    let seen = record_data(&link2);
    assert!(receiver.resume(bob.link_from(&alice, b2)));
    assert!(sender.resume(alice.link_to(&bob, a2)));

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(received.output, Some(ReceivedFile::Memory(data)));

    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|seq| !held.contains(*seq)));

    // Finished sessions accept no more commands.
    assert!(!sender.pause());
}

#[tokio::test]
async fn test_restart_resumes_from_stored_progress() {
    let config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(200 * 1024 + 17);
    let source = Arc::new(ChunkStore::from_bytes("restart.bin", data.clone(), config.chunk_size).unwrap());
    let dir = temp_dir();

    let (a, b, _link) = memory::pair_with(slow_link());
    let send = alice
        .sessions
        .send(source.clone(), alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob.sessions.receive(
        bob.identity.clone(),
        bob.link_from(&alice, b),
        ReceiveTarget::Directory(dir.clone()),
    );
    let transfer_id = send.transfer_id().unwrap();

    recv.control().wait_for(|s| s.acked_count() >= 50).await;
    send.pause();
    send.control().wait_for(|s| s.state == SessionState::Paused).await;
    recv.control().wait_for(|s| s.state == SessionState::Paused).await;
    // Simulate a crash: the old sessions are abandoned, not cancelled.
    drop(send);
    drop(recv);

    let held = bob.store.load_record(transfer_id).unwrap().unwrap().acked;
    assert!(held.len() >= 50);

    let (a2, b2, link2) = memory::pair();
    let seen = record_data(&link2);
    let send = alice
        .restarted(config.clone())
        .resume_send(transfer_id, source, alice.link_to(&bob, a2))
        .unwrap();
    let recv = bob
        .restarted(config.clone())
        .resume_receive(
            transfer_id,
            bob.identity.clone(),
            bob.link_from(&alice, b2),
            ReceiveTarget::Directory(dir.clone()),
        )
        .unwrap();

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(received.status, TransferStatus::Completed);

    let Some(ReceivedFile::Path(path)) = received.output else {
        panic!("expected a file on disk, got {:?}", received.output);
    };
    assert_eq!(path, dir.join("restart.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), data.to_vec());
    assert!(!dir.join(format!("{}.part", transfer_id)).exists());

    let seen = seen.lock().unwrap().clone();
    assert!(seen.iter().all(|seq| !held.contains(*seq)));

    // Terminal transfers cannot be resumed.
    let (a3, _b3, _link3) = memory::pair();
    let source = Arc::new(ChunkStore::from_bytes("restart.bin", data, config.chunk_size).unwrap());
    assert!(alice
        .sessions
        .resume_send(transfer_id, source, alice.link_to(&bob, a3))
        .is_err());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reaches_the_peer() {
    let config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let source = Arc::new(ChunkStore::from_bytes("cancel.bin", pattern(300 * 1024), 1024).unwrap());

    let (a, b, _link) = memory::pair_with(slow_link());
    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);
    let transfer_id = send.transfer_id().unwrap();

    send.control().wait_for(|s| s.acked_count() >= 5).await;
    send.cancel();

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Cancelled);
    assert_eq!(received.status, TransferStatus::Cancelled);
    assert_eq!(
        bob.store.load_record(transfer_id).unwrap().unwrap().status,
        TransferStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_group_member_failure_is_isolated() {
    let config = TransferConfig {
        chunk_size: 4096,
        ack_timeout: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        max_retries: 2,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let recipients: Vec<Node> = ["bob", "carol", "dave"]
        .iter()
        .map(|name| Node::new(name, config.clone()))
        .collect();
    let data = pattern(16 * 4096);
    let source = Arc::new(ChunkStore::from_bytes("group.bin", data.clone(), config.chunk_size).unwrap());

    let controller = GroupTransferController::new(
        config.clone(),
        GroupConfig::default(),
        alice.store.clone(),
        alice.logger.clone(),
    )
    .unwrap();

    let mut links = Vec::new();
    let mut receivers = Vec::new();
    for node in &recipients {
        let (a, b, link) = memory::pair();
        if node.name.as_str() == "carol" {
            link.set_filter_a_to_b(|frame| match data_sequence(frame) {
                Some(_) => FrameAction::Drop,
                None => FrameAction::Deliver,
            });
        }
        receivers.push(node.sessions.receive(
            node.identity.clone(),
            node.link_from(&alice, b),
            ReceiveTarget::Memory,
        ));
        links.push(alice.link_to(node, a));
    }

    let group_id = controller.start(source, links).unwrap();
    let outcome = controller.wait(group_id).await.unwrap();

    assert_eq!(outcome.completed(), 2);
    assert_eq!(outcome.failed(), 1);
    assert!(!outcome.all_completed());
    let carol = outcome.member(&PeerIdentity::new("carol")).unwrap();
    assert_eq!(carol.status, TransferStatus::Failed);
    assert!(carol.error.as_deref().unwrap().contains("retransmissions"));

    for (node, handle) in recipients.iter().zip(receivers) {
        let received = handle.wait().await;
        if node.name.as_str() == "carol" {
            assert_eq!(received.status, TransferStatus::Failed);
        } else {
            assert_eq!(received.output, Some(ReceivedFile::Memory(data.clone())));
        }
    }

    let progress = controller.progress(group_id).unwrap();
    assert_eq!(progress.total_chunks, 16);
    assert_eq!(progress.slowest, 0);
    assert!(progress.union.is_complete(16));
    assert_eq!(alice.store.list_group(group_id).unwrap().len(), 3);
    assert!(controller.remove(group_id).unwrap());
    assert!(controller.progress(group_id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_group_member_reconnects_after_link_loss() {
    let config = TransferConfig::default();
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let carol = Node::new("carol", config.clone());
    let data = pattern(10 * 1024 * 1024);
    let source = Arc::new(ChunkStore::from_bytes("big.bin", data.clone(), config.chunk_size).unwrap());
    assert_eq!(source.chunk_count(), 160);

    let controller = GroupTransferController::new(
        config.clone(),
        GroupConfig::default(),
        alice.store.clone(),
        alice.logger.clone(),
    )
    .unwrap();

    let (a1, b1, _link1) = memory::pair();
    let (a2, b2, link2) = memory::pair();
    let cut = link2.disconnector();
    link2.set_filter_a_to_b(move |frame| {
        if data_sequence(frame) == Some(80) {
            cut.cancel();
            return FrameAction::Drop;
        }
        FrameAction::Deliver
    });

    let bob_recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b1), ReceiveTarget::Memory);
    let carol_recv = carol
        .sessions
        .receive(carol.identity.clone(), carol.link_from(&alice, b2), ReceiveTarget::Memory);

    let group_id = controller
        .start(source, vec![alice.link_to(&bob, a1), alice.link_to(&carol, a2)])
        .unwrap();
    let progress = controller.progress(group_id).unwrap();
    let carol_id = progress
        .members
        .iter()
        .find(|m| m.peer == carol.name)
        .and_then(|m| m.transfer_id)
        .unwrap();
    let carol_send = controller.member(group_id, carol_id).unwrap();

    carol_send.wait_for(|s| s.state == SessionState::Paused).await;
    let paused = carol_recv
        .control()
        .wait_for(|s| s.state == SessionState::Paused)
        .await;
    assert_eq!(paused.acked, RangeSet::full(80));

    let bob_done = bob_recv.wait().await;
    assert_eq!(bob_done.output, Some(ReceivedFile::Memory(data.clone())));

    tokio::time::sleep(Duration::from_secs(3)).await;

    let (a3, b3, link3) = memory::pair();
    let seen = record_data(&link3);
    assert!(carol_recv.resume(carol.link_from(&alice, b3)));
    controller
        .resume_member(group_id, carol_id, alice.link_to(&carol, a3))
        .unwrap();

    let outcome = controller.wait(group_id).await.unwrap();
    assert!(outcome.all_completed());
    let carol_done = carol_recv.wait().await;
    assert_eq!(carol_done.output, Some(ReceivedFile::Memory(data)));

    let seen: BTreeSet<u32> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(seen.first(), Some(&80));
    assert_eq!(seen.len(), 80);
}

#[tokio::test]
async fn test_forged_ack_does_not_skip_chunks() {
    let config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(64 * 1024);
    let source = Arc::new(ChunkStore::from_bytes("forged.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, link) = memory::pair();
    let seen = record_data(&link);
    let mut forged = false;
    link.set_filter_b_to_a(move |frame| {
        if !forged && is_frame(frame, FrameType::Ack) {
            forged = true;
            return FrameAction::Replace(forge_full_ack(frame, 64));
        }
        FrameAction::Deliver
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);
    let transfer_id = send.transfer_id().unwrap();

    let sent = send.wait().await;
    let received = recv.wait().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(received.output, Some(ReceivedFile::Memory(data)));

    // Had the forged Ack counted, most chunks would never have gone out.
    let seen: BTreeSet<u32> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(seen, (0..64).collect::<BTreeSet<u32>>());
    assert!(frame_rejections(&alice.logger, "sender").contains(&"ack"));
    assert!(alice.store.load_record(transfer_id).unwrap().unwrap().all_acked());
}

#[tokio::test]
async fn test_cleartext_control_is_ignored_after_handshake() {
    let config = TransferConfig {
        chunk_size: 1024,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(64 * 1024);
    let source = Arc::new(ChunkStore::from_bytes("control.bin", data.clone(), config.chunk_size).unwrap());

    let (a, b, link) = memory::pair();
    let mut acks = 0;
    link.set_filter_b_to_a(move |frame| {
        let Some(Frame::Ack { transfer_id, .. }) = decode_frame(frame) else {
            return FrameAction::Deliver;
        };
        acks += 1;
        let injected = match acks {
            5 => HandshakeMessage::Reject {
                reason: "forged".into(),
            },
            6 => HandshakeMessage::Sealed {
                header: "AAAA".into(),
                ciphertext: "AAAA".into(),
            },
            _ => return FrameAction::Deliver,
        };
        FrameAction::Replace(protocol::encode_handshake(&transfer_id, &injected))
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    assert_eq!(send.wait().await.status, TransferStatus::Completed);
    assert_eq!(recv.wait().await.output, Some(ReceivedFile::Memory(data)));

    let rejected = frame_rejections(&alice.logger, "sender");
    assert!(rejected.contains(&"reject"));
    assert!(rejected.contains(&"sealed"));
}

#[tokio::test]
async fn test_file_metadata_never_crosses_in_the_clear() {
    let config = TransferConfig {
        chunk_size: 4096,
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let data = pattern(40 * 1024);
    let source = Arc::new(
        ChunkStore::from_bytes("quarterly-report.pdf", data.clone(), config.chunk_size).unwrap(),
    );
    let hash = source.metadata().content_hash.clone();
    let dir = temp_dir();

    let (a, b, link) = memory::pair();
    let wire: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    link.set_filter_a_to_b(record_handshakes(wire.clone()));
    link.set_filter_b_to_a(record_handshakes(wire.clone()));

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob.sessions.receive(
        bob.identity.clone(),
        bob.link_from(&alice, b),
        ReceiveTarget::Directory(dir.clone()),
    );

    assert_eq!(send.wait().await.status, TransferStatus::Completed);
    let received = recv.wait().await;
    assert_eq!(received.output, Some(ReceivedFile::Path(dir.join("quarterly-report.pdf"))));

    let wire = wire.lock().unwrap().clone();
    // Offer, Accept, Manifest, Resume, Complete.
    assert!(wire.len() >= 5);
    for frame in &wire {
        let text = String::from_utf8_lossy(frame);
        assert!(!text.contains("quarterly-report"));
        assert!(!text.contains(&hash));
    }

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out() {
    let config = TransferConfig {
        handshake_timeout: Duration::from_secs(5),
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", config.clone());
    let bob = Node::new("bob", config.clone());
    let source = Arc::new(ChunkStore::from_bytes("x", pattern(4096), 1024).unwrap());

    // Nobody reads the far end of either link.
    let (a, _b, _link) = memory::pair();
    let (_a2, b2, _link2) = memory::pair();
    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b2), ReceiveTarget::Memory);
    let transfer_id = send.transfer_id().unwrap();

    let sent = send.wait().await;
    assert_eq!(sent.status, TransferStatus::Failed);
    assert_eq!(sent.last_error.as_deref(), Some("handshake timed out"));
    let stored = alice.store.load_record(transfer_id).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Failed);

    let received = recv.wait().await;
    assert_eq!(received.status, TransferStatus::Failed);
    assert_eq!(received.last_error.as_deref(), Some("handshake timed out"));
    assert_eq!(received.transfer_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_silent_receiver_times_out_the_sender() {
    let sender_config = TransferConfig {
        chunk_size: 1024,
        inactivity_timeout: Duration::from_secs(3),
        ..TransferConfig::default()
    };
    let receiver_config = TransferConfig {
        chunk_size: 1024,
        inactivity_timeout: Duration::from_secs(60),
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", sender_config.clone());
    let bob = Node::new("bob", receiver_config);
    let source = Arc::new(ChunkStore::from_bytes("silent.bin", pattern(200 * 1024), 1024).unwrap());

    let (a, b, link) = memory::pair_with(slow_link());
    let mut acks = 0;
    link.set_filter_b_to_a(move |frame| {
        if is_frame(frame, FrameType::Ack) {
            acks += 1;
        }
        if acks > 10 {
            FrameAction::Drop
        } else {
            FrameAction::Deliver
        }
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);

    let sent = send.wait().await;
    assert_eq!(sent.status, TransferStatus::Failed);
    assert_eq!(sent.last_error.as_deref(), Some("peer inactivity timed out"));
    assert!(sent.acked_count() >= 10 && sent.acked_count() < 200);

    // The sealed Abort still reaches the receiver.
    let received = recv.wait().await;
    assert_eq!(received.status, TransferStatus::Failed);
    assert!(received.last_error.as_deref().unwrap().contains("aborted"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_sender_times_out_the_receiver() {
    let sender_config = TransferConfig {
        chunk_size: 1024,
        inactivity_timeout: Duration::from_secs(60),
        ..TransferConfig::default()
    };
    let receiver_config = TransferConfig {
        chunk_size: 1024,
        inactivity_timeout: Duration::from_secs(3),
        ..TransferConfig::default()
    };
    let alice = Node::new("alice", sender_config);
    let bob = Node::new("bob", receiver_config);
    let source = Arc::new(ChunkStore::from_bytes("stall.bin", pattern(64 * 1024), 1024).unwrap());

    let (a, b, link) = memory::pair();
    link.set_filter_a_to_b(|frame| match data_sequence(frame) {
        Some(_) => FrameAction::Drop,
        None => FrameAction::Deliver,
    });

    let send = alice
        .sessions
        .send(source, alice.link_to(&bob, a), SessionKind::Single)
        .unwrap();
    let recv = bob
        .sessions
        .receive(bob.identity.clone(), bob.link_from(&alice, b), ReceiveTarget::Memory);
    let transfer_id = send.transfer_id().unwrap();

    let received = recv.wait().await;
    assert_eq!(received.status, TransferStatus::Failed);
    assert_eq!(received.last_error.as_deref(), Some("peer inactivity timed out"));
    assert_eq!(received.acked_count(), 0);
    let stored = bob.store.load_record(transfer_id).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Failed);

    let sent = send.wait().await;
    assert_eq!(sent.status, TransferStatus::Failed);
    assert!(sent.last_error.as_deref().unwrap().contains("aborted"));
}

#[tokio::test(start_paused = true)]
async fn test_group_start_failure_cancels_started_members() {
    let alice = Node::new("alice", TransferConfig::default());
    let bob = Node::new("bob", TransferConfig::default());
    let source = Arc::new(ChunkStore::from_bytes("group.bin", pattern(8 * 1024), 1024).unwrap());
    let controller = GroupTransferController::new(
        TransferConfig::default(),
        GroupConfig::default(),
        alice.store.clone(),
        alice.logger.clone(),
    )
    .unwrap();

    let (a1, _b1, _link1) = memory::pair();
    let (a2, _b2, _link2) = memory::pair();
    // No public key for carol: her session cannot start.
    let links = vec![
        alice.link_to(&bob, a1),
        PeerLink::inbound(PeerIdentity::new("carol"), a2),
    ];
    assert!(controller.start(source, links).is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = alice.store.list_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].peer, bob.name);
    assert_eq!(records[0].direction, Direction::Send);
    assert_eq!(records[0].status, TransferStatus::Cancelled);
}
