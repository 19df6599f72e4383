/// Key derivation helpers shared by the handshake and the ratchet.
///
/// ```text
/// chain step:   message_key = HMAC(chain, 0x01)
///               next_chain  = HMAC(chain, 0x02)
/// ratchet turn: root', chain' = HKDF(salt = root, ikm = DH, "haven-ratchet-turn")
/// chunk AEAD:   key || nonce  = HKDF(ikm = message_key, "haven-chunk-aead")
/// control MAC:  key           = HKDF(salt = "haven-ratchet-v1", ikm = secret, "haven-control-mac")
/// ```

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

pub type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const MESSAGE_KEY_CONSTANT: u8 = 0x01;
const CHAIN_KEY_CONSTANT: u8 = 0x02;

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out)
        .expect("HKDF output length is within bounds");
}

pub fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Advance a chain key one step, returning the one-time message key.
/// The old chain key is overwritten in place.
pub fn step_chain(chain: &mut [u8; KEY_LEN]) -> Zeroizing<[u8; KEY_LEN]> {
    let message_key = Zeroizing::new(hmac(chain, &[&[MESSAGE_KEY_CONSTANT]]));
    *chain = hmac(chain, &[&[CHAIN_KEY_CONSTANT]]);
    message_key
}

/// Mix a fresh DH output into a root key. Returns `(new_root, new_chain)`.
pub fn turn_root(
    root: &[u8; KEY_LEN],
    dh: &[u8; KEY_LEN],
) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>) {
    let mut okm = Zeroizing::new([0u8; KEY_LEN * 2]);
    hkdf(Some(root.as_slice()), dh, b"haven-ratchet-turn", okm.as_mut_slice());
    let mut new_root = Zeroizing::new([0u8; KEY_LEN]);
    let mut new_chain = Zeroizing::new([0u8; KEY_LEN]);
    new_root.copy_from_slice(&okm[..KEY_LEN]);
    new_chain.copy_from_slice(&okm[KEY_LEN..]);
    (new_root, new_chain)
}

/// Expand a message key into an AES-256-GCM key and nonce.
pub fn aead_material(
    message_key: &[u8; KEY_LEN],
) -> (Zeroizing<[u8; KEY_LEN]>, [u8; NONCE_LEN]) {
    let mut okm = Zeroizing::new([0u8; KEY_LEN + NONCE_LEN]);
    hkdf(None, message_key, b"haven-chunk-aead", okm.as_mut_slice());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    key.copy_from_slice(&okm[..KEY_LEN]);
    nonce.copy_from_slice(&okm[KEY_LEN..]);
    (key, nonce)
}
