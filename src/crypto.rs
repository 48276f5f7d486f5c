//! Cryptographic primitives: AEAD, key derivation and session-id
//! derivation.
//!
//! All derivations are built on HMAC-SHA-256. The chain-key and
//! message-key tags are distinct single bytes; collapsing them would make
//! message keys equal to the next chain key.

use crate::error::{Error, Result};
use crate::keys::{DhOutput, KEY_LEN};

use chacha20poly1305::aead::{Aead as _, AeadCore, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of AEAD nonces (ChaCha20-Poly1305-IETF)
pub const NONCE_LEN: usize = 12;

/// Size of AEAD authentication tags
pub const TAG_LEN: usize = 16;

/// Size of derived session identifiers
pub const SESSION_ID_LEN: usize = 16;

/// HKDF info string for the root-chain step
const ROOT_CHAIN_INFO: &[u8] = b"RatchetChain";

/// HMAC key labelling the X3DH root derivation
const X3DH_ROOT_LABEL: &[u8] = b"X3DHRootKey";

/// Domain-separation tag for message keys
const MESSAGE_KEY_TAG: u8 = 0x01;

/// Domain-separation tag for chain-key advancement
const CHAIN_KEY_TAG: u8 = 0x02;

/// Derived symmetric key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get key as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Advance a chain key: `ck' = HMAC-SHA-256(ck, 0x02)`
#[must_use]
pub fn advance_chain_key(chain_key: &SymmetricKey) -> SymmetricKey {
    SymmetricKey(hmac_sha256(chain_key.as_bytes(), &[CHAIN_KEY_TAG]))
}

/// Derive a message key: `mk = HMAC-SHA-256(ck, 0x01)`
#[must_use]
pub fn derive_message_key(chain_key: &SymmetricKey) -> SymmetricKey {
    SymmetricKey(hmac_sha256(chain_key.as_bytes(), &[MESSAGE_KEY_TAG]))
}

/// Root-chain step of the DH ratchet
///
/// `PRK = HKDF-Extract(salt = root_key, ikm = dh_shared)` becomes the new
/// root key; `HKDF-Expand(PRK, "RatchetChain", 32)` seeds the chain key
/// for the new epoch.
#[must_use]
pub fn kdf_root_chain(root_key: &SymmetricKey, dh_shared: &DhOutput) -> (SymmetricKey, SymmetricKey) {
    let (prk, hk) = Hkdf::<Sha256>::extract(Some(root_key.as_bytes()), dh_shared.as_bytes());

    let mut okm = [0u8; KEY_LEN];
    hk.expand(ROOT_CHAIN_INFO, &mut okm)
        .expect("output size is valid");

    let new_root = SymmetricKey(prk.into());
    let chain = SymmetricKey(okm);
    okm.zeroize();
    (new_root, chain)
}

/// X3DH root-key derivation
///
/// `root = HMAC-SHA-256("X3DHRootKey", DH1 || DH2 || DH3 || DH4?)`
#[must_use]
pub fn derive_x3dh_root(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> SymmetricKey {
    let mut input = Vec::with_capacity(4 * KEY_LEN);
    input.extend_from_slice(dh1.as_bytes());
    input.extend_from_slice(dh2.as_bytes());
    input.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        input.extend_from_slice(dh4.as_bytes());
    }

    let root = SymmetricKey(hmac_sha256(X3DH_ROOT_LABEL, &input));
    input.zeroize();
    root
}

/// Deterministic session-id derivation
///
/// Both peers hash the lexicographically sorted device ids together with
/// the shared root key, so they arrive at the same 16-byte identifier
/// without it ever appearing on the wire.
#[must_use]
pub fn derive_session_id(
    local_id: &str,
    remote_id: &str,
    root_key: &[u8; KEY_LEN],
) -> [u8; SESSION_ID_LEN] {
    let (lo, hi) = if local_id <= remote_id {
        (local_id, remote_id)
    } else {
        (remote_id, local_id)
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(root_key).expect("HMAC accepts any key size");
    mac.update(lo.as_bytes());
    mac.update(hi.as_bytes());
    mac.update(root_key);
    let digest = mac.finalize().into_bytes();

    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&digest[..SESSION_ID_LEN]);
    session_id
}

/// ChaCha20-Poly1305-IETF authenticated encryption
///
/// Every encryption draws a fresh random 96-bit nonce; the output is
/// `nonce || ciphertext || tag`, so the codec never stores nonces
/// separately. Replacing the key wipes the previous one.
#[derive(Default)]
pub struct Aead {
    key: Option<SymmetricKey>,
}

impl Aead {
    /// Create an AEAD instance without a key
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key, wiping any previously installed one
    pub fn set_key(&mut self, key: SymmetricKey) {
        self.key = Some(key);
    }

    /// Drop (and wipe) the installed key
    pub fn clear_key(&mut self) {
        self.key = None;
    }

    /// Encrypt `plaintext`, binding `aad` into the authentication tag
    ///
    /// Fails with [`Error::NotInitialized`] when no key is installed.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.as_ref().ok_or(Error::NotInitialized)?;
        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::Crypto)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext || tag` produced by [`Aead::encrypt`]
    ///
    /// Returns `None` on a missing key, an input shorter than
    /// nonce + tag, or tag mismatch.
    #[must_use]
    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        let key = self.key.as_ref()?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return None;
        }

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        let (nonce, ct) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad })
            .ok()
    }
}

impl std::fmt::Debug for Aead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aead")
            .field("key_set", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SecretKey;
    use rand_core::OsRng;

    #[test]
    fn test_chain_kdf_tags_are_distinct() {
        let ck = SymmetricKey::from_bytes([42u8; KEY_LEN]);
        let mk = derive_message_key(&ck);
        let next = advance_chain_key(&ck);

        assert_ne!(mk.as_bytes(), next.as_bytes());
        assert_ne!(mk.as_bytes(), ck.as_bytes());
    }

    #[test]
    fn test_chain_kdf_deterministic() {
        let ck = SymmetricKey::from_bytes([7u8; KEY_LEN]);
        assert_eq!(
            derive_message_key(&ck).as_bytes(),
            derive_message_key(&ck).as_bytes()
        );
        assert_eq!(
            advance_chain_key(&ck).as_bytes(),
            advance_chain_key(&ck).as_bytes()
        );
    }

    #[test]
    fn test_root_chain_step_evolves_root() {
        let root = SymmetricKey::from_bytes([1u8; KEY_LEN]);
        let a = SecretKey::generate(&mut OsRng);
        let b = SecretKey::generate(&mut OsRng);
        let shared = a.diffie_hellman(&b.public_key()).unwrap();

        let (new_root, chain) = kdf_root_chain(&root, &shared);
        assert_ne!(new_root.as_bytes(), root.as_bytes());
        assert_ne!(chain.as_bytes(), new_root.as_bytes());
    }

    #[test]
    fn test_aead_roundtrip() {
        let mut aead = Aead::new();
        aead.set_key(SymmetricKey::from_bytes([9u8; KEY_LEN]));

        let ct = aead.encrypt(b"hello", b"header").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + 5 + TAG_LEN);

        let pt = aead.decrypt(&ct, b"header").unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn test_aead_detects_tampering() {
        let mut aead = Aead::new();
        aead.set_key(SymmetricKey::from_bytes([9u8; KEY_LEN]));

        let mut ct = aead.encrypt(b"hello", b"header").unwrap();
        ct[NONCE_LEN] ^= 1;
        assert!(aead.decrypt(&ct, b"header").is_none());

        let ct = aead.encrypt(b"hello", b"header").unwrap();
        assert!(aead.decrypt(&ct, b"other header").is_none());
    }

    #[test]
    fn test_aead_unset_key_fails() {
        let aead = Aead::new();
        assert_eq!(aead.encrypt(b"x", b""), Err(Error::NotInitialized));
        assert!(aead.decrypt(&[0u8; 64], b"").is_none());
    }

    #[test]
    fn test_aead_short_input() {
        let mut aead = Aead::new();
        aead.set_key(SymmetricKey::from_bytes([9u8; KEY_LEN]));
        assert!(aead.decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1], b"").is_none());
    }

    #[test]
    fn test_aead_empty_plaintext() {
        let mut aead = Aead::new();
        aead.set_key(SymmetricKey::from_bytes([3u8; KEY_LEN]));
        let ct = aead.encrypt(b"", b"aad").unwrap();
        assert_eq!(aead.decrypt(&ct, b"aad").unwrap(), b"");
    }

    #[test]
    fn test_session_id_symmetric() {
        let root = [5u8; KEY_LEN];
        let ab = derive_session_id("alice", "bob", &root);
        let ba = derive_session_id("bob", "alice", &root);
        assert_eq!(ab, ba);

        let other_root = derive_session_id("alice", "bob", &[6u8; KEY_LEN]);
        assert_ne!(ab, other_root);
    }

    #[test]
    fn test_x3dh_root_depends_on_opk() {
        let mk = |b: u8| {
            let a = SecretKey::from_bytes([b; KEY_LEN]);
            let p = SecretKey::from_bytes([b.wrapping_add(1); KEY_LEN]).public_key();
            a.diffie_hellman(&p).unwrap()
        };
        let (d1, d2, d3, d4) = (mk(1), mk(2), mk(3), mk(4));

        let without = derive_x3dh_root(&d1, &d2, &d3, None);
        let with = derive_x3dh_root(&d1, &d2, &d3, Some(&d4));
        assert_ne!(without.as_bytes(), with.as_bytes());
    }
}
