/// Transfer session lifecycle.
///
/// ```text
///            +-----------+
///  spawn --> |  Pending  |  (waiting for a group permit)
///            +-----------+
///                  |
///            +-------------+   handshake error / timeout
///            | Handshaking | -----------------------------+
///            +-------------+                              |
///              |         |                                v
///         +---------+ +-----------+   fatal error   +----------+
///         | Sending | | Receiving | --------------> |  Failed  |
///         +---------+ +-----------+                 +----------+
///              |    \   /    |
///   transport  |     \ /     |  all chunks + hash ok
///   loss/pause v      X      v
///         +--------+ / \ +-----------+
///         | Paused |/   \| Completed |
///         +--------+     +-----------+
///              | resume(link): fresh handshake, fresh ratchet
///              +--------------------------> Handshaking
///
///   cancel() from any state --> Cancelled
/// ```
///
/// Each session is one tokio task and the only writer of its
/// `TransferRecord`. Callers steer it through a `SessionControl`
/// (commands over mpsc, state over watch, cancellation token).

use std::sync::Arc;

use bytes::Bytes;
use haven_crypto::{HybridKeyPair, HybridPublicKey, RatchetSession};
use haven_db::PersistedTransferState;
use haven_types::{
    Direction, PeerIdentity, RangeSet, SessionKind, TransferId, TransferRecord, TransferStatus,
};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{ChannelWriter, TransportError, TransportHandle};
use crate::chunk::{ChunkStore, ReceiveTarget, ReceivedFile};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{self, ControlMessage, Frame, FrameAuth, HandshakeMessage};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Everything needed to reach one peer over one connection.
pub struct PeerLink {
    pub peer: PeerIdentity,
    /// The receiver's long-lived hybrid public key. Required to send.
    pub remote_key: Option<HybridPublicKey>,
    pub transport: TransportHandle,
}

impl PeerLink {
    /// Link used to send to `peer`.
    pub fn outbound(peer: PeerIdentity, remote_key: HybridPublicKey, transport: TransportHandle) -> Self {
        Self {
            peer,
            remote_key: Some(remote_key),
            transport,
        }
    }

    /// Link used to receive from `peer`.
    pub fn inbound(peer: PeerIdentity, transport: TransportHandle) -> Self {
        Self {
            peer,
            remote_key: None,
            transport,
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Handshaking,
    Sending,
    Receiving,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Handshaking => "handshaking",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_terminal(status: TransferStatus) -> Option<Self> {
        match status {
            TransferStatus::Completed => Some(Self::Completed),
            TransferStatus::Failed => Some(Self::Failed),
            TransferStatus::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Unknown to a receiver until the first offer arrives.
    pub transfer_id: Option<TransferId>,
    pub peer: PeerIdentity,
    pub direction: Direction,
    pub kind: SessionKind,
    pub state: SessionState,
    pub status: TransferStatus,
    pub acked: RangeSet,
    pub total_chunks: u32,
    pub retransmits: u64,
    pub last_error: Option<String>,
    /// Set on a completed receive.
    pub output: Option<ReceivedFile>,
}

impl SessionSnapshot {
    pub fn acked_count(&self) -> u64 {
        self.acked.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub(crate) enum Command {
    Pause,
    Resume(PeerLink),
}

/// Cloneable control surface of a running session.
#[derive(Clone)]
pub struct SessionControl {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionControl {
    /// Drop the connection and keep progress. A no-op if already paused.
    /// Returns false once the session has ended.
    pub fn pause(&self) -> bool {
        self.commands.send(Command::Pause).is_ok()
    }

    /// Reconnect a paused session over a new link. Ignored unless paused.
    pub fn resume(&self, link: PeerLink) -> bool {
        self.commands.send(Command::Resume(link)).is_ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.snapshot.clone();
        if let Ok(snapshot) = rx.wait_for(|s| predicate(s)).await {
            return snapshot.clone();
        }
        // Session task has exited; the last value is final.
        let last = rx.borrow().clone();
        last
    }

    pub async fn wait_terminal(&self) -> SessionSnapshot {
        self.wait_for(|s| s.is_terminal()).await
    }
}

pub struct SessionHandle {
    control: SessionControl,
    task: JoinHandle<SessionSnapshot>,
}

impl SessionHandle {
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self, link: PeerLink) -> bool {
        self.control.resume(link)
    }

    pub fn cancel(&self) {
        self.control.cancel()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.control.snapshot()
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.control.snapshot().transfer_id
    }

    /// Wait for the session task to end and return its final state.
    pub async fn wait(self) -> SessionSnapshot {
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let mut snapshot = self.control.snapshot();
                snapshot.status = TransferStatus::Failed;
                snapshot.state = SessionState::Failed;
                snapshot.last_error = Some(format!("session task ended abnormally: {}", e));
                snapshot
            }
        }
    }
}

/// Factory for transfer sessions sharing one configuration, store and logger.
#[derive(Clone)]
pub struct TransferSession {
    config: Arc<TransferConfig>,
    store: Arc<dyn PersistedTransferState>,
    logger: Arc<dyn TransferLogger>,
    limiter: Option<Arc<Semaphore>>,
}

impl TransferSession {
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn PersistedTransferState>,
        logger: Arc<dyn TransferLogger>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            logger,
            limiter: None,
        })
    }

    /// Every connection attempt first takes a permit from `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start sending `source` to the peer behind `link` as a new transfer.
    pub fn send(
        &self,
        source: Arc<ChunkStore>,
        link: PeerLink,
        kind: SessionKind,
    ) -> Result<SessionHandle, TransferError> {
        if link.remote_key.is_none() {
            return Err(TransferError::Protocol(format!(
                "no public key known for peer {}",
                link.peer
            )));
        }
        let transfer_id = TransferId::new();
        let record = TransferRecord::new(
            transfer_id,
            link.peer.clone(),
            Direction::Send,
            kind,
            source.metadata().clone(),
            source.chunk_size(),
        );
        self.store.save(&record)?;
        let endpoint = Endpoint::Send(Sender::new(transfer_id, source));
        Ok(self.spawn(endpoint, link, Some(record), Direction::Send, kind))
    }

    /// Continue a stored outgoing transfer, e.g. after a restart. Chunks
    /// the record lists as acknowledged are not sent again.
    pub fn resume_send(
        &self,
        transfer_id: TransferId,
        source: Arc<ChunkStore>,
        link: PeerLink,
    ) -> Result<SessionHandle, TransferError> {
        let record = self.load_resumable(transfer_id, Direction::Send, &link)?;
        if &record.file != source.metadata() || record.chunk_size != source.chunk_size() {
            return Err(TransferError::Protocol(
                "source file changed since the transfer started".into(),
            ));
        }
        let kind = record.kind;
        let endpoint = Endpoint::Send(Sender::new(transfer_id, source));
        Ok(self.spawn(endpoint, link, Some(record), Direction::Send, kind))
    }

    /// Wait for an offer on `link` and receive whatever it describes.
    pub fn receive(
        &self,
        identity: Arc<HybridKeyPair>,
        link: PeerLink,
        target: ReceiveTarget,
    ) -> SessionHandle {
        let endpoint = Endpoint::Receive(Receiver::new(identity, target, None));
        self.spawn(endpoint, link, None, Direction::Receive, SessionKind::Single)
    }

    /// Continue a stored incoming transfer. Only an offer for `transfer_id`
    /// is accepted.
    pub fn resume_receive(
        &self,
        transfer_id: TransferId,
        identity: Arc<HybridKeyPair>,
        link: PeerLink,
        target: ReceiveTarget,
    ) -> Result<SessionHandle, TransferError> {
        let record = self.load_resumable(transfer_id, Direction::Receive, &link)?;
        let kind = record.kind;
        let endpoint = Endpoint::Receive(Receiver::new(identity, target, Some(transfer_id)));
        Ok(self.spawn(endpoint, link, Some(record), Direction::Receive, kind))
    }

    fn load_resumable(
        &self,
        transfer_id: TransferId,
        direction: Direction,
        link: &PeerLink,
    ) -> Result<TransferRecord, TransferError> {
        let record = self
            .store
            .load(transfer_id)?
            .ok_or(TransferError::UnknownTransfer(transfer_id))?;
        if record.direction != direction {
            return Err(TransferError::Protocol(format!(
                "transfer {} runs in the other direction",
                transfer_id
            )));
        }
        if record.status.is_terminal() {
            return Err(TransferError::Protocol(format!(
                "transfer {} already {}",
                transfer_id, record.status
            )));
        }
        if record.peer != link.peer {
            return Err(TransferError::Protocol(format!(
                "transfer {} belongs to peer {}",
                transfer_id, record.peer
            )));
        }
        Ok(record)
    }

    fn spawn(
        &self,
        endpoint: Endpoint,
        link: PeerLink,
        record: Option<TransferRecord>,
        direction: Direction,
        kind: SessionKind,
    ) -> SessionHandle {
        let initial = SessionSnapshot {
            transfer_id: record.as_ref().map(|r| r.transfer_id),
            peer: link.peer.clone(),
            direction,
            kind,
            state: SessionState::Pending,
            status: record.as_ref().map(|r| r.status).unwrap_or(TransferStatus::Pending),
            acked: record.as_ref().map(|r| r.acked.clone()).unwrap_or_default(),
            total_chunks: record.as_ref().map(|r| r.chunk_count()).unwrap_or(0),
            retransmits: 0,
            last_error: None,
            output: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let core = SessionCore {
            config: self.config.clone(),
            store: self.store.clone(),
            logger: self.logger.clone(),
            snapshot: snapshot_tx,
            commands: command_rx,
            commands_open: true,
            cancel: cancel.clone(),
            record,
            peer: link.peer.clone(),
            component: match direction {
                Direction::Send => "sender",
                Direction::Receive => "receiver",
            },
        };
        let task = tokio::spawn(drive(core, endpoint, link, self.limiter.clone()));

        SessionHandle {
            control: SessionControl {
                commands: command_tx,
                snapshot: snapshot_rx,
                cancel,
            },
            task,
        }
    }
}

pub(crate) enum Endpoint {
    Send(Sender),
    Receive(Receiver),
}

impl Endpoint {
    async fn connect(
        &mut self,
        core: &mut SessionCore,
        link: &mut PeerLink,
    ) -> Result<ConnectionEnd, TransferError> {
        match self {
            Self::Send(sender) => sender.connect(core, link).await,
            Self::Receive(receiver) => receiver.connect(core, link).await,
        }
    }

    fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::Send(sender) => Some(sender.transfer_id()),
            Self::Receive(receiver) => receiver.transfer_id(),
        }
    }

    /// The session ratchet of the last connection, until `disconnect`.
    fn ratchet_mut(&mut self) -> Option<&mut RatchetSession> {
        match self {
            Self::Send(sender) => sender.ratchet_mut(),
            Self::Receive(receiver) => receiver.ratchet_mut(),
        }
    }

    /// Wipe the connection's session keys.
    fn disconnect(&mut self) {
        match self {
            Self::Send(sender) => sender.disconnect(),
            Self::Receive(receiver) => receiver.disconnect(),
        }
    }

    /// Best-effort last word to the peer; the link may already be gone.
    /// Sealed once session keys exist, a cleartext Reject before that.
    fn notify_peer(&mut self, link: &PeerLink, message: ControlMessage) {
        let Some(transfer_id) = self.transfer_id() else {
            return;
        };
        let wire = match self.ratchet_mut() {
            Some(ratchet) => match protocol::seal_control(ratchet, &transfer_id, &message) {
                Ok(sealed) => sealed,
                Err(e) => {
                    debug!(transfer_id = %transfer_id, "{} not sent: {}", message.name(), e);
                    return;
                }
            },
            None => HandshakeMessage::Reject {
                reason: match message {
                    ControlMessage::Reject { reason }
                    | ControlMessage::Abort { reason }
                    | ControlMessage::Cancel { reason } => reason,
                    other => other.name().to_string(),
                },
            },
        };
        let _ = link
            .transport
            .channel
            .send(protocol::encode_handshake(&transfer_id, &wire));
    }
}

/// Seal `message` and write it ahead of any queued data.
pub(crate) fn send_control(
    writer: &ChannelWriter,
    ratchet: &mut RatchetSession,
    transfer_id: &TransferId,
    message: &ControlMessage,
) -> Result<(), TransferError> {
    let sealed = protocol::seal_control(ratchet, transfer_id, message)?;
    writer.write_now(protocol::encode_handshake(transfer_id, &sealed))?;
    Ok(())
}

/// How one connection ended without an error.
pub(crate) enum ConnectionEnd {
    Completed,
    Paused,
}

/// What `SessionCore::next_frame` woke up for.
pub(crate) enum Next {
    Frame(Frame),
    Deadline,
    Pause,
}

/// State shared by the sender and receiver halves: record, persistence,
/// logging, snapshots and command intake.
pub(crate) struct SessionCore {
    pub config: Arc<TransferConfig>,
    store: Arc<dyn PersistedTransferState>,
    logger: Arc<dyn TransferLogger>,
    snapshot: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    pub cancel: CancellationToken,
    record: Option<TransferRecord>,
    peer: PeerIdentity,
    component: &'static str,
}

impl SessionCore {
    pub fn transfer_id(&self) -> Option<TransferId> {
        self.record.as_ref().map(|r| r.transfer_id)
    }

    pub fn record(&self) -> Option<&TransferRecord> {
        self.record.as_ref()
    }

    pub fn acked(&self) -> RangeSet {
        self.record.as_ref().map(|r| r.acked.clone()).unwrap_or_default()
    }

    pub fn is_acked(&self, sequence: u32) -> bool {
        self.record.as_ref().is_some_and(|r| r.acked.contains(sequence))
    }

    pub fn all_acked(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.all_acked())
    }

    pub fn load(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        Ok(self.store.load(transfer_id)?)
    }

    pub fn log(&self, event: TransferEvent) {
        let transfer_id = self
            .transfer_id()
            .unwrap_or_else(|| TransferId::from_bytes([0; 16]));
        self.logger.log(TransferLog {
            component: self.component,
            transfer_id,
            peer: self.peer.clone(),
            event,
        });
    }

    pub fn set_state(&self, state: SessionState) {
        self.snapshot.send_modify(|s| s.state = state);
    }

    pub fn set_retransmits(&self, retransmits: u64) {
        self.snapshot.send_modify(|s| s.retransmits = retransmits);
    }

    pub fn set_output(&self, output: ReceivedFile) {
        self.snapshot.send_modify(|s| s.output = Some(output));
    }

    /// Take ownership of a record learned from an offer.
    pub fn adopt(&mut self, record: TransferRecord) {
        self.snapshot.send_modify(|s| {
            s.transfer_id = Some(record.transfer_id);
            s.status = record.status;
            s.acked = record.acked.clone();
            s.total_chunks = record.chunk_count();
            s.kind = record.kind;
        });
        self.record = Some(record);
    }

    /// Merge newly acknowledged chunks. Returns true if anything was new.
    pub fn merge_acked(&mut self, acked: &RangeSet) -> bool {
        match self.record.as_mut() {
            Some(record) => record.acked.merge(acked),
            None => false,
        }
    }

    pub fn mark_acked(&mut self, sequence: u32) -> bool {
        match self.record.as_mut() {
            Some(record) => record.acked.insert(sequence),
            None => false,
        }
    }

    /// Write the record through the store and publish it.
    pub fn persist(&mut self) -> Result<(), TransferError> {
        let Some(record) = self.record.as_mut() else {
            return Ok(());
        };
        record.touch();
        self.store.save(record)?;
        let (status, acked) = (record.status, record.acked.clone());
        self.snapshot.send_modify(|s| {
            s.status = status;
            s.acked = acked;
        });
        Ok(())
    }

    /// Move to `status` and persist.
    pub fn transition(&mut self, status: TransferStatus) -> Result<(), TransferError> {
        if let Some(record) = self.record.as_mut() {
            let from = record.status;
            if record.transition(status) {
                self.log(TransferEvent::StatusChanged { from, to: status });
            }
        }
        self.persist()
    }

    /// Next frame for this transfer, a deadline, or a pause request.
    /// Cancellation and the end of the incoming stream come back as errors.
    pub async fn next_frame(
        &mut self,
        incoming: &mut mpsc::Receiver<Bytes>,
        deadline: Instant,
    ) -> Result<Next, TransferError> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Pause) => return Ok(Next::Pause),
                    Some(Command::Resume(_)) => debug!("resume ignored, session is connected"),
                    None => self.commands_open = false,
                },
                data = incoming.recv() => {
                    let Some(data) = data else {
                        return Err(TransportError::Closed.into());
                    };
                    let Some(frame) = protocol::decode_frame(&data) else {
                        warn!(len = data.len(), "undecodable frame dropped");
                        continue;
                    };
                    if let Some(expected) = self.transfer_id() {
                        if frame.transfer_id() != expected {
                            self.log(TransferEvent::TransferIdMismatch { got: frame.transfer_id() });
                            continue;
                        }
                    }
                    return Ok(Next::Frame(frame));
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(Next::Deadline),
            }
        }
    }

    /// Block while paused. Returns the link to reconnect over, or None if
    /// the session was cancelled.
    async fn wait_for_resume(&mut self) -> Option<PeerLink> {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                command = self.commands.recv(), if self.commands_open => command,
            };
            match command {
                Some(Command::Resume(link)) => {
                    if let Some(record) = &self.record {
                        if record.peer != link.peer {
                            warn!(
                                transfer_id = %record.transfer_id,
                                expected = %record.peer,
                                got = %link.peer,
                                "resume over a link to a different peer refused"
                            );
                            continue;
                        }
                    }
                    return Some(link);
                }
                Some(Command::Pause) => {}
                None => {
                    // No handle left to resume us; only cancellation can end this.
                    self.commands_open = false;
                    self.cancel.cancelled().await;
                    return None;
                }
            }
        }
    }

    fn pause(&mut self, error: Option<String>) {
        if let Err(e) = self.transition(TransferStatus::Paused) {
            warn!("failed to persist paused state: {}", e);
        }
        self.snapshot.send_modify(|s| {
            s.state = SessionState::Paused;
            s.last_error = error;
        });
    }

    fn finish(&mut self, status: TransferStatus, error: Option<String>) {
        if let Some(record) = self.record.as_mut() {
            if error.is_some() && !record.status.is_terminal() {
                record.last_error = error.clone();
            }
        }
        if let Err(e) = self.transition(status) {
            warn!("failed to persist final state: {}", e);
        }
        let final_status = self.record.as_ref().map(|r| r.status).unwrap_or(status);
        self.snapshot.send_modify(|s| {
            s.status = final_status;
            s.state = SessionState::from_terminal(final_status).unwrap_or(SessionState::Failed);
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    /// Decrypt a control message under the live session. Cleartext and
    /// unauthenticated messages are logged and dropped.
    pub fn open_control(
        &self,
        ratchet: &mut RatchetSession,
        transfer_id: &TransferId,
        message: &HandshakeMessage,
    ) -> Option<ControlMessage> {
        match protocol::open_control(ratchet, transfer_id, message) {
            Ok(control) => Some(control),
            Err(e) => {
                self.log(TransferEvent::FrameRejected {
                    kind: message.name(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Check the tag on an Ack or Nack.
    pub fn verify_frame(&self, ratchet: &RatchetSession, kind: &'static str, auth: &FrameAuth) -> bool {
        if auth.verify(ratchet) {
            return true;
        }
        self.log(TransferEvent::FrameRejected {
            kind,
            reason: "tag does not verify".into(),
        });
        false
    }
}

async fn drive(
    mut core: SessionCore,
    mut endpoint: Endpoint,
    link: PeerLink,
    limiter: Option<Arc<Semaphore>>,
) -> SessionSnapshot {
    let mut next_link = Some(link);

    loop {
        let mut link = match next_link.take() {
            Some(link) => link,
            None => match core.wait_for_resume().await {
                Some(link) => link,
                None => {
                    core.finish(TransferStatus::Cancelled, None);
                    break;
                }
            },
        };

        let _permit = match &limiter {
            Some(limiter) => {
                core.set_state(SessionState::Pending);
                tokio::select! {
                    biased;
                    _ = core.cancel.cancelled() => {
                        core.finish(TransferStatus::Cancelled, None);
                        break;
                    }
                    permit = limiter.clone().acquire_owned() => permit.ok(),
                }
            }
            None => None,
        };

        core.peer = link.peer.clone();
        core.snapshot.send_modify(|s| s.peer = link.peer.clone());
        core.set_state(SessionState::Handshaking);

        let done = match endpoint.connect(&mut core, &mut link).await {
            Ok(ConnectionEnd::Completed) => {
                core.finish(TransferStatus::Completed, None);
                true
            }
            Ok(ConnectionEnd::Paused) => {
                link.transport.channel.close();
                core.pause(None);
                false
            }
            Err(TransferError::Cancelled) => {
                if core.cancel.is_cancelled() {
                    endpoint.notify_peer(&link, ControlMessage::Cancel {
                        reason: "cancelled by user".into(),
                    });
                }
                core.finish(TransferStatus::Cancelled, None);
                true
            }
            Err(e) if e.is_transient() => {
                core.log(TransferEvent::Error { message: e.to_string() });
                core.pause(Some(e.to_string()));
                false
            }
            Err(e) => {
                if !matches!(e, TransferError::Aborted(_) | TransferError::Rejected(_)) {
                    endpoint.notify_peer(&link, ControlMessage::Abort { reason: e.to_string() });
                }
                core.log(TransferEvent::Error { message: e.to_string() });
                core.finish(TransferStatus::Failed, Some(e.to_string()));
                true
            }
        };
        // Every connection gets fresh keys; the old ones go now.
        endpoint.disconnect();
        if done {
            break;
        }
    }

    let snapshot = core.snapshot.borrow().clone();
    snapshot
}
