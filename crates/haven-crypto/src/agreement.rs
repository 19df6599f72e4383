/// Hybrid key agreement: X25519 Diffie-Hellman and Kyber-1024 encapsulation,
/// combined through HKDF so that breaking one primitive alone does not
/// reveal the secret.
///
/// ```text
/// Initiator                                      Responder (key known via signaling)
///   ephemeral E                                    static R = (x25519_R, kem_R)
///   dh1 = X25519(E, x25519_R)
///   ss, ct = Kyber.Encaps(kem_R)
///   ---- Offer { E.pub, ct, tag_i } ---------------->
///                                                  dh1 = X25519(R, E.pub)
///                                                  ss  = Kyber.Decaps(ct)
///                                                  verify tag_i
///                                                  ephemeral F
///                                                  dh2 = X25519(F, E.pub)
///   <------------------- Accept { F.pub, tag_r } ---
///   dh2 = X25519(E, F.pub)
///   verify tag_r
///
/// th    = SHA-256(salt | E.pub | R | ct | context)
/// early = HKDF(salt = "haven-hybrid-v1", ikm = dh1 | ss, info = th)  -> early[32] | confirm_i[32]
/// final = HKDF(salt = early, ikm = dh2, info = th | F.pub)           -> secret[32] | confirm_r[32]
/// ```
///
/// Both confirmation tags bind the full transcript, so a swapped key, a
/// corrupted ciphertext or a decapsulation mismatch all end in
/// `HandshakeError::ConfirmationFailed` instead of two peers silently holding
/// different secrets. Both halves of dh2 are ephemeral: the long-lived key R
/// alone never yields the secret of a recorded session.

use hmac::Mac;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::HandshakeError;
use crate::kdf::{self, HmacSha256, KEY_LEN};
use crate::keys::{self, HybridKeyPair, HybridPublicKey, X25519_KEY_LEN};
use crate::ratchet::Role;

const HYBRID_SALT: &[u8] = b"haven-hybrid-v1";
const INITIATOR_LABEL: &[u8] = b"haven-confirm-initiator";
const RESPONDER_LABEL: &[u8] = b"haven-confirm-responder";

/// 32-byte secret shared by exactly one pair of peers. Moved into the
/// `RatchetSession` that consumes it; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// First handshake message, sent by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOffer {
    pub initiator_x25519: [u8; X25519_KEY_LEN],
    pub kem_ciphertext: Vec<u8>,
    pub confirm: [u8; 32],
}

/// Responder's answer: its ephemeral ratchet key and confirmation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub responder_ratchet: [u8; X25519_KEY_LEN],
    pub confirm: [u8; 32],
}

/// Key material the ratchet starts from, besides the secret.
pub(crate) enum RatchetSeed {
    Initiator {
        local_public: [u8; X25519_KEY_LEN],
        remote_ratchet: [u8; X25519_KEY_LEN],
    },
    /// The responder's handshake ephemeral receives the first DH turn.
    Responder { ratchet: StaticSecret },
}

/// Outcome of a completed agreement, consumed by `RatchetSession::new`.
pub struct SessionKeys {
    pub(crate) secret: SharedSecret,
    pub(crate) seed: RatchetSeed,
}

impl SessionKeys {
    pub fn role(&self) -> Role {
        match self.seed {
            RatchetSeed::Initiator { .. } => Role::Initiator,
            RatchetSeed::Responder { .. } => Role::Responder,
        }
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

/// Initiator state between sending the offer and receiving the response.
pub struct PendingAgreement {
    early: Zeroizing<[u8; KEY_LEN]>,
    transcript_hash: [u8; 32],
    local: StaticSecret,
    local_public: [u8; X25519_KEY_LEN],
}

impl std::fmt::Debug for PendingAgreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAgreement").finish_non_exhaustive()
    }
}

impl PendingAgreement {
    /// Mix in the responder's ephemeral key, check its tag and release the
    /// session keys.
    pub fn finish(self, response: &HandshakeResponse) -> Result<SessionKeys, HandshakeError> {
        let dh = exchange(&self.local, &response.responder_ratchet)?;
        let (secret, confirm_key) =
            final_stage(&self.early, &dh, &self.transcript_hash, &response.responder_ratchet);
        verify_tag(
            &confirm_key,
            RESPONDER_LABEL,
            &[self.transcript_hash.as_slice(), response.responder_ratchet.as_slice()],
            &response.confirm,
        )?;
        Ok(SessionKeys {
            secret,
            seed: RatchetSeed::Initiator {
                local_public: self.local_public,
                remote_ratchet: response.responder_ratchet,
            },
        })
    }
}

fn transcript_hash(
    initiator_x25519: &[u8; X25519_KEY_LEN],
    responder: &HybridPublicKey,
    kem_ciphertext: &[u8],
    context: &[u8],
) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(HYBRID_SALT);
    h.update(initiator_x25519);
    h.update(responder.x25519);
    h.update(&responder.kem);
    h.update(kem_ciphertext);
    h.update((context.len() as u64).to_be_bytes());
    h.update(context);
    h.finalize().into()
}

fn split_pair(okm: &[u8]) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>) {
    let mut first = Zeroizing::new([0u8; KEY_LEN]);
    let mut second = Zeroizing::new([0u8; KEY_LEN]);
    first.copy_from_slice(&okm[..KEY_LEN]);
    second.copy_from_slice(&okm[KEY_LEN..KEY_LEN * 2]);
    (first, second)
}

/// Key confirmed by the offer: static DH plus KEM. Returns `(early, confirm_i)`.
fn early_stage(
    dh: &[u8; 32],
    kem_ss: &[u8],
    transcript_hash: &[u8; 32],
) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>) {
    let mut ikm = Zeroizing::new(Vec::with_capacity(dh.len() + kem_ss.len()));
    ikm.extend_from_slice(dh);
    ikm.extend_from_slice(kem_ss);

    let mut okm = Zeroizing::new([0u8; KEY_LEN * 2]);
    kdf::hkdf(Some(HYBRID_SALT), &ikm, transcript_hash, okm.as_mut_slice());
    split_pair(okm.as_slice())
}

/// Mix the ephemeral-ephemeral DH into the early key. Returns
/// `(secret, confirm_r)`.
fn final_stage(
    early: &[u8; KEY_LEN],
    dh: &[u8; 32],
    transcript_hash: &[u8; 32],
    responder_ratchet: &[u8; X25519_KEY_LEN],
) -> (SharedSecret, Zeroizing<[u8; KEY_LEN]>) {
    let mut info = [0u8; 64];
    info[..32].copy_from_slice(transcript_hash);
    info[32..].copy_from_slice(responder_ratchet);

    let mut okm = Zeroizing::new([0u8; KEY_LEN * 2]);
    kdf::hkdf(Some(early.as_slice()), dh, &info, okm.as_mut_slice());
    let (secret, confirm) = split_pair(okm.as_slice());
    (SharedSecret(*secret), confirm)
}

fn exchange(
    local: &StaticSecret,
    remote: &[u8; X25519_KEY_LEN],
) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
    let shared = local.diffie_hellman(&PublicKey::from(*remote));
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

fn tag(key: &[u8; KEY_LEN], label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
    all.push(label);
    all.extend_from_slice(parts);
    kdf::hmac(key, &all)
}

fn verify_tag(
    key: &[u8; KEY_LEN],
    label: &[u8],
    parts: &[&[u8]],
    received: &[u8],
) -> Result<(), HandshakeError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(received)
        .map_err(|_| HandshakeError::ConfirmationFailed)
}

/// Initiator half. `local` should be a fresh ephemeral pair for every
/// handshake; `context` binds the exchange to a transfer (its id).
pub fn initiate(
    local: &HybridKeyPair,
    remote: &HybridPublicKey,
    context: &[u8],
) -> Result<(HandshakeOffer, PendingAgreement), HandshakeError> {
    let dh = local.diffie_hellman(&remote.x25519)?;
    let (kem_ss, kem_ciphertext) = keys::encapsulate(remote)?;

    let initiator_x25519 = local.x25519_public();
    let th = transcript_hash(&initiator_x25519, remote, &kem_ciphertext, context);
    let (early, confirm_key) = early_stage(&dh, &kem_ss, &th);

    let offer = HandshakeOffer {
        initiator_x25519,
        kem_ciphertext,
        confirm: tag(&confirm_key, INITIATOR_LABEL, &[th.as_slice()]),
    };
    let pending = PendingAgreement {
        early,
        transcript_hash: th,
        local: local.x25519_secret(),
        local_public: initiator_x25519,
    };
    Ok((offer, pending))
}

/// Responder half: `agree(localKeyPair, remotePublicKey)` where the remote
/// key arrives inside the offer. Returns the session keys and the response
/// to send back in the accept message.
pub fn agree(
    local: &HybridKeyPair,
    offer: &HandshakeOffer,
    context: &[u8],
) -> Result<(SessionKeys, HandshakeResponse), HandshakeError> {
    let dh = local.diffie_hellman(&offer.initiator_x25519)?;
    let kem_ss = local.decapsulate(&offer.kem_ciphertext)?;

    let th = transcript_hash(
        &offer.initiator_x25519,
        &local.public_key(),
        &offer.kem_ciphertext,
        context,
    );
    let (early, confirm_initiator) = early_stage(&dh, &kem_ss, &th);
    verify_tag(&confirm_initiator, INITIATOR_LABEL, &[th.as_slice()], &offer.confirm)?;

    let ratchet = StaticSecret::random_from_rng(OsRng);
    let responder_ratchet = *PublicKey::from(&ratchet).as_bytes();
    let dh = exchange(&ratchet, &offer.initiator_x25519)?;
    let (secret, confirm_key) = final_stage(&early, &dh, &th, &responder_ratchet);

    let response = HandshakeResponse {
        responder_ratchet,
        confirm: tag(&confirm_key, RESPONDER_LABEL, &[th.as_slice(), responder_ratchet.as_slice()]),
    };
    let keys = SessionKeys {
        secret,
        seed: RatchetSeed::Responder { ratchet },
    };
    Ok((keys, response))
}
