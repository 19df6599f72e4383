/// Fan-out of one file to many recipients.
///
/// ```text
///                      Arc<ChunkStore> (plaintext, read once)
///                     /        |         \
///   session A (own keys)  session B   session C      <= max_concurrent_sessions
///        ratchet A         ratchet B   ratchet C        run at once, the rest
///            |                 |           |            wait as Pending
///         peer A            peer B      peer C
/// ```
///
/// Every member is an ordinary `TransferSession` tagged
/// `SessionKind::GroupMember`; a failure, pause or cancel of one member
/// never touches its siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use haven_db::PersistedTransferState;
use haven_types::{GroupId, PeerIdentity, RangeSet, SessionKind, TransferId, TransferStatus};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::chunk::ChunkStore;
use crate::config::{GroupConfig, TransferConfig};
use crate::error::TransferError;
use crate::logging::TransferLogger;
use crate::session::{PeerLink, SessionControl, SessionHandle, SessionSnapshot, TransferSession};

struct Member {
    transfer_id: TransferId,
    handle: SessionHandle,
}

struct Group {
    total_chunks: u32,
    members: Vec<Member>,
}

/// Aggregate progress of a group send.
#[derive(Debug, Clone)]
pub struct GroupProgress {
    pub group_id: GroupId,
    pub total_chunks: u32,
    /// Fewest chunks acknowledged by any member.
    pub slowest: u64,
    /// Chunks at least one member has acknowledged.
    pub union: RangeSet,
    pub members: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub transfer_id: TransferId,
    pub peer: PeerIdentity,
    pub status: TransferStatus,
    pub error: Option<String>,
}

/// Final state of every member. Partial success is a normal outcome.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub group_id: GroupId,
    pub members: Vec<MemberOutcome>,
}

impl GroupOutcome {
    pub fn completed(&self) -> usize {
        self.count(TransferStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TransferStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        self.completed() == self.members.len()
    }

    pub fn member(&self, peer: &PeerIdentity) -> Option<&MemberOutcome> {
        self.members.iter().find(|m| &m.peer == peer)
    }

    fn count(&self, status: TransferStatus) -> usize {
        self.members.iter().filter(|m| m.status == status).count()
    }
}

pub struct GroupTransferController {
    sessions: TransferSession,
    groups: Mutex<HashMap<GroupId, Group>>,
}

impl GroupTransferController {
    pub fn new(
        config: TransferConfig,
        group: GroupConfig,
        store: Arc<dyn PersistedTransferState>,
        logger: Arc<dyn TransferLogger>,
    ) -> Result<Self, TransferError> {
        if group.max_concurrent_sessions == 0 {
            return Err(TransferError::Config(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        let limiter = Arc::new(Semaphore::new(group.max_concurrent_sessions));
        Ok(Self {
            sessions: TransferSession::new(config, store, logger)?.with_limiter(limiter),
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Start one session per recipient. Each gets its own handshake and
    /// ratchet; only the plaintext source is shared. If any recipient cannot
    /// be started, the members already spawned are cancelled and the group
    /// is never registered.
    pub fn start(
        &self,
        source: Arc<ChunkStore>,
        recipients: Vec<PeerLink>,
    ) -> Result<GroupId, TransferError> {
        let group_id = GroupId::new();
        let kind = SessionKind::GroupMember { group_id };

        let mut members: Vec<Member> = Vec::with_capacity(recipients.len());
        for link in recipients {
            let peer = link.peer.clone();
            let started = self.sessions.send(source.clone(), link, kind).and_then(|handle| {
                let transfer_id = handle.transfer_id().ok_or_else(|| {
                    handle.cancel();
                    TransferError::Protocol("send session without a transfer id".into())
                })?;
                Ok(Member {
                    transfer_id,
                    handle,
                })
            });
            match started {
                Ok(member) => members.push(member),
                Err(e) => {
                    warn!(
                        group_id = %group_id,
                        peer = %peer,
                        started = members.len(),
                        "group start failed, cancelling started members: {}",
                        e
                    );
                    for member in &members {
                        member.handle.cancel();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            group_id = %group_id,
            recipients = members.len(),
            file = %source.metadata().name,
            "group transfer started"
        );
        self.lock().insert(
            group_id,
            Group {
                total_chunks: source.chunk_count(),
                members,
            },
        );
        Ok(group_id)
    }

    pub fn progress(&self, group_id: GroupId) -> Result<GroupProgress, TransferError> {
        let groups = self.lock();
        let group = groups
            .get(&group_id)
            .ok_or(TransferError::UnknownGroup(group_id))?;

        let members: Vec<SessionSnapshot> = group.members.iter().map(|m| m.handle.snapshot()).collect();
        let slowest = members.iter().map(|s| s.acked_count()).min().unwrap_or(0);
        let union = members
            .iter()
            .fold(RangeSet::new(), |acc, s| acc.union(&s.acked));

        Ok(GroupProgress {
            group_id,
            total_chunks: group.total_chunks,
            slowest,
            union,
            members,
        })
    }

    /// Resolve once every member has reached a terminal status.
    pub async fn wait(&self, group_id: GroupId) -> Result<GroupOutcome, TransferError> {
        let controls = self.controls(group_id)?;
        let mut members = Vec::with_capacity(controls.len());
        for (transfer_id, control) in controls {
            let snapshot = control.wait_terminal().await;
            members.push(MemberOutcome {
                transfer_id,
                peer: snapshot.peer,
                status: snapshot.status,
                error: snapshot.last_error,
            });
        }
        Ok(GroupOutcome { group_id, members })
    }

    pub fn members(&self, group_id: GroupId) -> Result<Vec<TransferId>, TransferError> {
        Ok(self.controls(group_id)?.into_iter().map(|(id, _)| id).collect())
    }

    pub fn member(
        &self,
        group_id: GroupId,
        transfer_id: TransferId,
    ) -> Result<SessionControl, TransferError> {
        self.controls(group_id)?
            .into_iter()
            .find(|(id, _)| *id == transfer_id)
            .map(|(_, control)| control)
            .ok_or(TransferError::UnknownTransfer(transfer_id))
    }

    pub fn pause_member(&self, group_id: GroupId, transfer_id: TransferId) -> Result<(), TransferError> {
        self.member(group_id, transfer_id)?.pause();
        Ok(())
    }

    pub fn resume_member(
        &self,
        group_id: GroupId,
        transfer_id: TransferId,
        link: PeerLink,
    ) -> Result<(), TransferError> {
        self.member(group_id, transfer_id)?.resume(link);
        Ok(())
    }

    pub fn cancel_member(&self, group_id: GroupId, transfer_id: TransferId) -> Result<(), TransferError> {
        self.member(group_id, transfer_id)?.cancel();
        Ok(())
    }

    /// Cancel every member of the group.
    pub fn cancel(&self, group_id: GroupId) -> Result<(), TransferError> {
        for (_, control) in self.controls(group_id)? {
            control.cancel();
        }
        info!(group_id = %group_id, "group transfer cancelled");
        Ok(())
    }

    /// Forget a group whose members have all finished.
    pub fn remove(&self, group_id: GroupId) -> Result<bool, TransferError> {
        let mut groups = self.lock();
        let group = groups
            .get(&group_id)
            .ok_or(TransferError::UnknownGroup(group_id))?;
        if group.members.iter().all(|m| m.handle.snapshot().is_terminal()) {
            groups.remove(&group_id);
            return Ok(true);
        }
        Ok(false)
    }

    fn controls(&self, group_id: GroupId) -> Result<Vec<(TransferId, SessionControl)>, TransferError> {
        let groups = self.lock();
        let group = groups
            .get(&group_id)
            .ok_or(TransferError::UnknownGroup(group_id))?;
        Ok(group
            .members
            .iter()
            .map(|m| (m.transfer_id, m.handle.control()))
            .collect())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<GroupId, Group>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
