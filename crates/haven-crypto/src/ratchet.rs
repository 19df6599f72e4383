/// Per-chunk ratcheting cipher.
///
/// ```text
/// SharedSecret ──HKDF──► root/chain (initiator → responder)
///                    ├─► root/chain (responder → initiator)
///                    └─► control MAC key
///
/// every message:  message_key, chain' = step(chain)            (symmetric ratchet)
/// every K msgs/T: root', chain' = HKDF(root, DH(E_n, F_peer))   (DH turn, epoch + 1)
/// ```
///
/// Each message key is used once for AES-256-GCM and then dropped. The
/// receiver tolerates loss and reordering by caching skipped message keys
/// (bounded, oldest evicted).
///
/// Only the initiator turns. Every turn pairs a fresh initiator ephemeral
/// with the responder's current ratchet key F, which the responder replaces
/// as soon as it has followed the turn. The new F travels back in an
/// authenticated [`Announcement`]; the initiator turns again only after it
/// has seen the announcement for its current epoch, so the responder is
/// never more than one epoch behind and every turn uses a key the peer
/// still holds.
///
/// Header on the wire (52 bytes, big-endian):
///
/// ```text
/// [0..4]   epoch
/// [4..12]  counter within epoch
/// [12..20] length of the previous sending chain
/// [20..52] sender's current ratchet public key
/// ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::Mac;
use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::agreement::{RatchetSeed, SessionKeys};
use crate::error::RatchetError;
use crate::kdf::{self, HmacSha256, KEY_LEN};

pub const HEADER_LEN: usize = 52;

/// AES-GCM tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// HMAC-SHA256 tag on control frames.
pub const CONTROL_TAG_LEN: usize = 32;

const RATCHET_SALT: &[u8] = b"haven-ratchet-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    pub epoch: u32,
    pub counter: u64,
    pub previous_chain_len: u64,
    pub ratchet_public: [u8; 32],
}

impl RatchetHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.epoch.to_be_bytes());
        buf[4..12].copy_from_slice(&self.counter.to_be_bytes());
        buf[12..20].copy_from_slice(&self.previous_chain_len.to_be_bytes());
        buf[20..52].copy_from_slice(&self.ratchet_public);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RatchetError> {
        if data.len() != HEADER_LEN {
            return Err(RatchetError::MalformedHeader);
        }
        let mut ratchet_public = [0u8; 32];
        ratchet_public.copy_from_slice(&data[20..52]);
        Ok(Self {
            epoch: u32::from_be_bytes(data[0..4].try_into().unwrap()),
            counter: u64::from_be_bytes(data[4..12].try_into().unwrap()),
            previous_chain_len: u64::from_be_bytes(data[12..20].try_into().unwrap()),
            ratchet_public,
        })
    }
}

/// Responder → initiator: "I have followed you into `epoch`; turn the next
/// epoch against `ratchet_public`". Only meaningful on an authenticated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub epoch: u32,
    pub ratchet_public: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Turn cadence and skip tolerance.
#[derive(Debug, Clone)]
pub struct RatchetConfig {
    /// Turn after this many messages in one epoch.
    pub turn_every_messages: u64,
    /// Turn once an epoch is this old, even if few messages were sent.
    pub turn_every: Duration,
    /// Upper bound on cached skipped-message keys and on how far ahead a
    /// single message may jump.
    pub max_skip: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            turn_every_messages: 256,
            turn_every: Duration::from_secs(120),
            max_skip: 1024,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SendingChain {
    root: [u8; KEY_LEN],
    key: [u8; KEY_LEN],
    epoch: u32,
    counter: u64,
    previous_chain_len: u64,
    ratchet_public: [u8; 32],
    #[zeroize(skip)]
    started: Instant,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ReceivingChain {
    root: [u8; KEY_LEN],
    key: [u8; KEY_LEN],
    epoch: u32,
    next_counter: u64,
}

type SkippedKey = ((u32, u64), Zeroizing<[u8; KEY_LEN]>);

pub struct RatchetSession {
    role: Role,
    config: RatchetConfig,
    sending: SendingChain,
    receiving: ReceivingChain,
    /// Responder: secret the next incoming turn is computed with.
    local_ratchet: Option<StaticSecret>,
    local_public: [u8; 32],
    /// Initiator: responder key for the next turn, once announced.
    remote_ratchet: Option<[u8; 32]>,
    control_key: Zeroizing<[u8; KEY_LEN]>,
    skipped: HashMap<(u32, u64), Zeroizing<[u8; KEY_LEN]>>,
    skipped_order: VecDeque<(u32, u64)>,
    destroyed: bool,
}

impl RatchetSession {
    /// Consume freshly agreed session keys. The role follows from which
    /// half of the agreement produced them.
    pub fn new(keys: SessionKeys, config: RatchetConfig) -> Self {
        let role = keys.role();
        let SessionKeys { secret, seed } = keys;

        let mut okm = Zeroizing::new([0u8; KEY_LEN * 4]);
        kdf::hkdf(
            Some(RATCHET_SALT),
            secret.as_bytes(),
            b"haven-directional-roots",
            okm.as_mut_slice(),
        );
        let mut control_key = Zeroizing::new([0u8; KEY_LEN]);
        kdf::hkdf(
            Some(RATCHET_SALT),
            secret.as_bytes(),
            b"haven-control-mac",
            control_key.as_mut_slice(),
        );
        drop(secret);

        let (send_at, recv_at) = match role {
            Role::Initiator => (0, KEY_LEN * 2),
            Role::Responder => (KEY_LEN * 2, 0),
        };
        let split = |at: usize| {
            let mut root = [0u8; KEY_LEN];
            let mut key = [0u8; KEY_LEN];
            root.copy_from_slice(&okm[at..at + KEY_LEN]);
            key.copy_from_slice(&okm[at + KEY_LEN..at + KEY_LEN * 2]);
            (root, key)
        };
        let (send_root, send_key) = split(send_at);
        let (recv_root, recv_key) = split(recv_at);

        let (local_ratchet, local_public, remote_ratchet) = match seed {
            RatchetSeed::Initiator {
                local_public,
                remote_ratchet,
            } => (None, local_public, Some(remote_ratchet)),
            RatchetSeed::Responder { ratchet } => {
                let public = *PublicKey::from(&ratchet).as_bytes();
                (Some(ratchet), public, None)
            }
        };

        Self {
            role,
            config,
            sending: SendingChain {
                root: send_root,
                key: send_key,
                epoch: 0,
                counter: 0,
                previous_chain_len: 0,
                ratchet_public: local_public,
                started: Instant::now(),
            },
            receiving: ReceivingChain {
                root: recv_root,
                key: recv_key,
                epoch: 0,
                next_counter: 0,
            },
            local_ratchet,
            local_public,
            remote_ratchet,
            control_key,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
            destroyed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sending_epoch(&self) -> u32 {
        self.sending.epoch
    }

    pub fn receiving_epoch(&self) -> u32 {
        self.receiving.epoch
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Encrypt one message under a fresh message key. `aad` is bound into
    /// the tag along with the header.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, RatchetHeader), RatchetError> {
        self.ensure_live()?;
        if let Some(remote) = self.turn_due() {
            self.turn_sending(remote);
        }

        let header = RatchetHeader {
            epoch: self.sending.epoch,
            counter: self.sending.counter,
            previous_chain_len: self.sending.previous_chain_len,
            ratchet_public: self.sending.ratchet_public,
        };
        let message_key = kdf::step_chain(&mut self.sending.key);
        self.sending.counter += 1;

        let ciphertext = seal(&message_key, &header, aad, plaintext)?;
        Ok((ciphertext, header))
    }

    /// Decrypt one message. Receiving state only advances once the tag has
    /// verified, so a forged or corrupted message changes nothing.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        self.ensure_live()?;
        let id = (header.epoch, header.counter);
        let auth_failed = RatchetError::Authentication {
            epoch: header.epoch,
            counter: header.counter,
        };
        let too_far = RatchetError::TooFarAhead {
            epoch: header.epoch,
            counter: header.counter,
        };

        if let Some(key) = self.skipped.get(&id) {
            let plaintext = open(key, header, aad, ciphertext).map_err(|_| auth_failed)?;
            self.skipped.remove(&id);
            self.skipped_order.retain(|k| *k != id);
            return Ok(plaintext);
        }

        let current = self.receiving.epoch;
        if header.epoch < current
            || (header.epoch == current && header.counter < self.receiving.next_counter)
        {
            return Err(RatchetError::Replay {
                epoch: header.epoch,
                counter: header.counter,
            });
        }
        if header.epoch > current + 1 {
            return Err(too_far);
        }

        let max_skip = self.config.max_skip as u64;
        let mut chain = self.receiving.clone();
        let mut staged: Vec<SkippedKey> = Vec::new();

        if header.epoch == current + 1 {
            if header.previous_chain_len.saturating_sub(chain.next_counter) > max_skip {
                return Err(too_far);
            }
            skip_until(&mut chain, header.previous_chain_len, &mut staged);

            // Only a responder follows turns.
            let local = self.local_ratchet.as_ref().ok_or(auth_failed.clone())?;
            let shared = local.diffie_hellman(&PublicKey::from(header.ratchet_public));
            if !shared.was_contributory() {
                return Err(auth_failed);
            }
            let dh = Zeroizing::new(*shared.as_bytes());
            let (root, key) = kdf::turn_root(&chain.root, &dh);
            chain.root = *root;
            chain.key = *key;
            chain.epoch = header.epoch;
            chain.next_counter = 0;
        }

        if header.counter - chain.next_counter > max_skip {
            return Err(too_far);
        }
        skip_until(&mut chain, header.counter, &mut staged);
        let message_key = kdf::step_chain(&mut chain.key);
        chain.next_counter += 1;

        let plaintext = open(&message_key, header, aad, ciphertext).map_err(|_| auth_failed)?;

        if chain.epoch != current {
            self.rotate_local();
            tracing::debug!(role = ?self.role, epoch = chain.epoch, "receiving chain turned");
        }
        self.receiving = chain;
        for (id, key) in staged {
            self.cache_skipped(id, key);
        }
        Ok(plaintext)
    }

    /// What a responder tells the initiator: the epoch it has reached and
    /// the key that will receive the next turn.
    pub fn announcement(&self) -> Announcement {
        Announcement {
            epoch: self.receiving.epoch,
            ratchet_public: self.local_public,
        }
    }

    /// Initiator: take in an authenticated announcement. One for the
    /// current epoch unlocks the next turn; stale ones are ignored.
    pub fn observe_remote(&mut self, announcement: &Announcement) {
        if self.role != Role::Initiator || self.destroyed {
            return;
        }
        if announcement.epoch == self.sending.epoch && self.remote_ratchet.is_none() {
            self.remote_ratchet = Some(announcement.ratchet_public);
        }
    }

    /// HMAC over a control frame under this session's control key.
    pub fn control_tag(&self, data: &[u8]) -> Result<[u8; CONTROL_TAG_LEN], RatchetError> {
        self.ensure_live()?;
        Ok(kdf::hmac(self.control_key.as_slice(), &[data]))
    }

    /// Constant-time check of a control frame tag.
    pub fn verify_control_tag(&self, data: &[u8], tag: &[u8]) -> bool {
        if self.destroyed {
            return false;
        }
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(self.control_key.as_slice()) else {
            return false;
        };
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }

    /// Zero all key material. Every later call fails with `Destroyed`.
    pub fn wipe(&mut self) {
        self.sending.zeroize();
        self.receiving.zeroize();
        self.control_key.zeroize();
        self.skipped.clear();
        self.skipped_order.clear();
        self.local_ratchet = None;
        self.local_public.zeroize();
        self.remote_ratchet = None;
        self.destroyed = true;
    }

    fn ensure_live(&self) -> Result<(), RatchetError> {
        if self.destroyed {
            Err(RatchetError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// The responder key to turn against, if a turn is due now.
    fn turn_due(&self) -> Option<[u8; 32]> {
        let s = &self.sending;
        let due = s.counter > 0
            && (s.counter >= self.config.turn_every_messages
                || s.started.elapsed() >= self.config.turn_every);
        if due { self.remote_ratchet } else { None }
    }

    fn turn_sending(&mut self, remote: [u8; 32]) {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(remote));
        let dh = Zeroizing::new(*shared.as_bytes());
        let (root, key) = kdf::turn_root(&self.sending.root, &dh);

        let s = &mut self.sending;
        s.root = *root;
        s.key = *key;
        s.previous_chain_len = s.counter;
        s.counter = 0;
        s.epoch += 1;
        s.ratchet_public = *public.as_bytes();
        s.started = Instant::now();
        self.remote_ratchet = None;
        tracing::debug!(role = ?self.role, epoch = s.epoch, "sending chain turned");
    }

    /// Responder: drop the key that just received a turn and pick the one
    /// for the next.
    fn rotate_local(&mut self) {
        let next = StaticSecret::random_from_rng(OsRng);
        self.local_public = *PublicKey::from(&next).as_bytes();
        self.sending.ratchet_public = self.local_public;
        self.local_ratchet = Some(next);
    }

    fn cache_skipped(&mut self, id: (u32, u64), key: Zeroizing<[u8; KEY_LEN]>) {
        self.skipped.insert(id, key);
        self.skipped_order.push_back(id);
        while self.skipped_order.len() > self.config.max_skip {
            if let Some(oldest) = self.skipped_order.pop_front() {
                self.skipped.remove(&oldest);
            }
        }
    }
}

fn skip_until(chain: &mut ReceivingChain, until: u64, staged: &mut Vec<SkippedKey>) {
    while chain.next_counter < until {
        let key = kdf::step_chain(&mut chain.key);
        staged.push(((chain.epoch, chain.next_counter), key));
        chain.next_counter += 1;
    }
}

fn associated_data(header: &RatchetHeader, aad: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(aad.len() + HEADER_LEN);
    ad.extend_from_slice(aad);
    ad.extend_from_slice(&header.to_bytes());
    ad
}

fn seal(
    message_key: &[u8; KEY_LEN],
    header: &RatchetHeader,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    let (key, nonce) = kdf::aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| RatchetError::Encryption)?;
    let ad = associated_data(header, aad);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &ad })
        .map_err(|_| RatchetError::Encryption)
}

fn open(
    message_key: &[u8; KEY_LEN],
    header: &RatchetHeader,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ()> {
    let (key, nonce) = kdf::aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| ())?;
    let ad = associated_data(header, aad);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &ad })
        .map_err(|_| ())
}
