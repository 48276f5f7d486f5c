//! Double-ratchet session state machine.
//!
//! Combines a DH ratchet (run whenever the remote advertises a new public
//! key) with a per-message symmetric ratchet. Both peers initialize from
//! the same 32-byte root key; each direction evolves its own chain key
//! and counter, and message keys for out-of-order deliveries are cached
//! in a bounded skipped-key map.
//!
//! ## DH steps
//!
//! A single root-chain step feeds both directions: the receiving chain is
//! seeded from the same output as the sending chain. The explicit
//! [`Ratchet::ratchet_step`] rotates the local DH keypair before deriving
//! the shared secret, so the next outbound header advertises the key the
//! peer needs for its matching step; the receive side runs that matching
//! step implicitly (without rotating) when an inbound header carries an
//! unseen public key. The very first inbound message only records the
//! remote key: both sides are still on the root-derived chains, and no
//! common secret exists to step with yet.
//!
//! ## Failure atomicity
//!
//! `decrypt` stages every root/chain/counter change and all newly skipped
//! keys against a scratch copy and commits only after the AEAD tag
//! verifies. Authentication failures, floods, bad keys and replays leave
//! the ratchet exactly as it was.

use crate::crypto::{
    advance_chain_key, derive_message_key, kdf_root_chain, Aead, SymmetricKey,
};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey, KEY_LEN};
use crate::wire::{Reader, Writer};

use rand_core::CryptoRngCore;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

/// Default bound on the skipped-message gap and on cached skipped keys
pub const MAX_SKIP_DEFAULT: u32 = 1000;

/// Version tag leading every exported state blob
const STATE_VERSION: u16 = 1;

/// Ratchet header length: `u32` message index plus the DH public key
const HEADER_LEN: usize = 4 + KEY_LEN;

/// Bytes per serialized skipped-key entry in the state blob
const SKIPPED_ENTRY_LEN: usize = 4 + KEY_LEN;

/// Authenticated ratchet header: `u32_be(message_index) || dh_pub`
struct Header {
    message_index: u32,
    dh_public: PublicKey,
}

impl Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_LEN);
        w.put_u32(self.message_index);
        w.put_bytes(self.dh_public.as_bytes());
        w.into_bytes()
    }

    /// Parse an exact-length header; anything else fails authentication
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::Authentication);
        }
        let mut r = Reader::new(bytes);
        let message_index = r.u32().map_err(|_| Error::Authentication)?;
        let dh_public = PublicKey::from_bytes(r.array::<KEY_LEN>().map_err(|_| Error::Authentication)?);
        Ok(Self {
            message_index,
            dh_public,
        })
    }
}

/// Count-bounded cache of message keys for out-of-order delivery
///
/// When the cache is full, the lowest (oldest) message index is evicted
/// first. Removed keys are wiped on drop.
struct SkippedKeys {
    keys: BTreeMap<u32, SymmetricKey>,
    capacity: usize,
}

impl SkippedKeys {
    fn new(capacity: usize) -> Self {
        Self {
            keys: BTreeMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, index: u32, key: SymmetricKey) {
        while self.keys.len() >= self.capacity {
            if self.keys.pop_first().is_none() {
                break;
            }
        }
        self.keys.insert(index, key);
    }

    fn get(&self, index: u32) -> Option<&SymmetricKey> {
        self.keys.get(&index)
    }

    fn remove(&mut self, index: u32) -> Option<SymmetricKey> {
        self.keys.remove(&index)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    fn iter(&self) -> impl Iterator<Item = (&u32, &SymmetricKey)> {
        self.keys.iter()
    }
}

/// Staged receive-path state, committed only after a successful decrypt
struct PendingState {
    root_key: SymmetricKey,
    send_chain_key: SymmetricKey,
    recv_chain_key: SymmetricKey,
    send_counter: u32,
    recv_counter: u32,
    last_remote_pub: Option<PublicKey>,
}

/// Double-ratchet state for one 1:1 session
pub struct Ratchet {
    root_key: SymmetricKey,
    send_chain_key: SymmetricKey,
    recv_chain_key: SymmetricKey,
    send_counter: u32,
    recv_counter: u32,
    dh_secret: SecretKey,
    dh_public: PublicKey,
    last_remote_pub: Option<PublicKey>,
    session_id: Option<Vec<u8>>,
    skipped: SkippedKeys,
    max_skip: u32,
}

impl Ratchet {
    /// Create an uninitialized ratchet with a fresh DH keypair
    pub fn new<R: CryptoRngCore>(rng: &mut R) -> Self {
        let dh_secret = SecretKey::generate(rng);
        let dh_public = dh_secret.public_key();
        Self {
            root_key: SymmetricKey::from_bytes([0u8; KEY_LEN]),
            send_chain_key: SymmetricKey::from_bytes([0u8; KEY_LEN]),
            recv_chain_key: SymmetricKey::from_bytes([0u8; KEY_LEN]),
            send_counter: 0,
            recv_counter: 0,
            dh_secret,
            dh_public,
            last_remote_pub: None,
            session_id: None,
            skipped: SkippedKeys::new(MAX_SKIP_DEFAULT as usize),
            max_skip: MAX_SKIP_DEFAULT,
        }
    }

    /// Initialize chains and counters from a shared root key
    ///
    /// Both chain keys start as the root key; counters reset and any
    /// cached skipped keys are wiped.
    pub fn initialize(&mut self, root_key: &[u8; KEY_LEN], session_id: &[u8]) {
        self.root_key = SymmetricKey::from_bytes(*root_key);
        self.send_chain_key = SymmetricKey::from_bytes(*root_key);
        self.recv_chain_key = SymmetricKey::from_bytes(*root_key);
        self.send_counter = 0;
        self.recv_counter = 0;
        self.last_remote_pub = None;
        self.session_id = Some(session_id.to_vec());
        self.skipped.clear();
    }

    /// Current local DH public key, as advertised in outbound headers
    #[must_use]
    pub fn dh_public(&self) -> PublicKey {
        self.dh_public
    }

    /// Session identifier, if initialized
    #[must_use]
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Messages sent in the current chain
    #[must_use]
    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    /// Messages received in the current chain
    #[must_use]
    pub fn recv_counter(&self) -> u32 {
        self.recv_counter
    }

    /// Number of cached skipped message keys
    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Override the skipped-message bound (default 1000)
    ///
    /// Also bounds the skipped-key cache capacity.
    pub fn set_max_skip(&mut self, max_skip: u32) {
        self.max_skip = max_skip;
        self.skipped.capacity = max_skip as usize;
    }

    /// Perform an explicit DH ratchet step towards `remote_pub`
    ///
    /// Rotates the local DH keypair, then runs one root-chain step keyed
    /// by the fresh shared secret. Both chains are reseeded from the step
    /// output and both counters reset. The peer performs its matching
    /// step implicitly when it sees the new public key in a header.
    pub fn ratchet_step(&mut self, remote_pub: &PublicKey) -> Result<()> {
        use rand_core::OsRng;

        let fresh = SecretKey::generate(&mut OsRng);
        let shared = fresh.diffie_hellman(remote_pub)?;
        let (new_root, chain) = kdf_root_chain(&self.root_key, &shared);

        self.dh_public = fresh.public_key();
        self.dh_secret = fresh;
        self.root_key = new_root;
        self.send_chain_key = chain.clone();
        self.recv_chain_key = chain;
        self.send_counter = 0;
        self.recv_counter = 0;
        self.last_remote_pub = Some(*remote_pub);
        Ok(())
    }

    /// Encrypt a plaintext into an envelope
    ///
    /// The header (message index, local DH public key) is bound into the
    /// AEAD tag as associated data. The sender device id is left empty
    /// for the dispatcher to stamp.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        let session_id = self.session_id.clone().ok_or(Error::NotInitialized)?;

        let header = Header {
            message_index: self.send_counter,
            dh_public: self.dh_public,
        };
        let header_bytes = header.to_bytes();

        let mut aead = Aead::new();
        aead.set_key(derive_message_key(&self.send_chain_key));
        let ciphertext = aead.encrypt(plaintext, &header_bytes)?;

        let envelope = Envelope {
            session_id,
            message_index: self.send_counter,
            previous_counter: self.recv_counter,
            timestamp: now_ms(),
            sender_device_id: String::new(),
            associated_data: header_bytes,
            ciphertext,
        };

        self.send_chain_key = advance_chain_key(&self.send_chain_key);
        self.send_counter += 1;
        Ok(envelope)
    }

    /// Decrypt an envelope, tolerating out-of-order delivery
    ///
    /// State is only mutated when the AEAD tag verifies; any error leaves
    /// the ratchet untouched. A message index below the receive counter
    /// with no cached key is treated as a replay and fails authentication.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        let session_id = self.session_id.as_ref().ok_or(Error::NotInitialized)?;
        if envelope.session_id != *session_id {
            return Err(Error::SessionMismatch);
        }

        let header = Header::parse(&envelope.associated_data)?;

        let mut next = PendingState {
            root_key: self.root_key.clone(),
            send_chain_key: self.send_chain_key.clone(),
            recv_chain_key: self.recv_chain_key.clone(),
            send_counter: self.send_counter,
            recv_counter: self.recv_counter,
            last_remote_pub: self.last_remote_pub,
        };

        match self.last_remote_pub {
            // First contact: adopt the remote key. Both sides are still
            // on the root-derived chains, so there is nothing to step.
            None => next.last_remote_pub = Some(header.dh_public),
            // Unseen remote key: implicit DH step with the current
            // keypair, matching the sender's explicit step.
            Some(known) if known != header.dh_public => {
                let shared = self.dh_secret.diffie_hellman(&header.dh_public)?;
                let (new_root, chain) = kdf_root_chain(&next.root_key, &shared);
                next.root_key = new_root;
                next.send_chain_key = chain.clone();
                next.recv_chain_key = chain;
                next.send_counter = 0;
                next.recv_counter = 0;
                next.last_remote_pub = Some(header.dh_public);
            }
            Some(_) => {}
        }

        let msg_num = header.message_index;

        if msg_num < next.recv_counter {
            // Late delivery or replay: only the skipped cache can serve it
            let mk = self.skipped.get(msg_num).ok_or(Error::Authentication)?;
            let mut aead = Aead::new();
            aead.set_key(mk.clone());
            let plaintext = aead
                .decrypt(&envelope.ciphertext, &envelope.associated_data)
                .ok_or(Error::Authentication)?;
            self.skipped.remove(msg_num);
            return Ok(plaintext);
        }

        let gap = msg_num - next.recv_counter;
        if gap > self.max_skip {
            return Err(Error::Flood);
        }

        let mut pending_skipped: Vec<(u32, SymmetricKey)> = Vec::with_capacity(gap as usize);
        while next.recv_counter < msg_num {
            pending_skipped.push((next.recv_counter, derive_message_key(&next.recv_chain_key)));
            next.recv_chain_key = advance_chain_key(&next.recv_chain_key);
            next.recv_counter += 1;
        }

        let mut aead = Aead::new();
        aead.set_key(derive_message_key(&next.recv_chain_key));
        let plaintext = aead
            .decrypt(&envelope.ciphertext, &envelope.associated_data)
            .ok_or(Error::Authentication)?;

        next.recv_chain_key = advance_chain_key(&next.recv_chain_key);
        next.recv_counter = msg_num + 1;

        self.root_key = next.root_key;
        self.send_chain_key = next.send_chain_key;
        self.recv_chain_key = next.recv_chain_key;
        self.send_counter = next.send_counter;
        self.recv_counter = next.recv_counter;
        self.last_remote_pub = next.last_remote_pub;
        for (index, key) in pending_skipped {
            self.skipped.insert(index, key);
        }

        Ok(plaintext)
    }

    /// Serialize the full ratchet state into a versioned blob
    ///
    /// The blob contains every secret the session depends on; encrypting
    /// it at rest is the caller's responsibility.
    #[must_use]
    pub fn export_state(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(
            2 + 3 * KEY_LEN + 8 + 2 * KEY_LEN + 8 + 40 + 4 + self.skipped.len() * SKIPPED_ENTRY_LEN,
        );
        w.put_u16(STATE_VERSION);
        w.put_bytes(self.root_key.as_bytes());
        w.put_bytes(self.send_chain_key.as_bytes());
        w.put_bytes(self.recv_chain_key.as_bytes());
        w.put_u32(self.send_counter);
        w.put_u32(self.recv_counter);
        w.put_bytes(&self.dh_secret.to_bytes());
        w.put_bytes(self.dh_public.as_bytes());
        w.put_block(self.session_id.as_deref().unwrap_or(&[]));
        match self.last_remote_pub {
            Some(pk) => w.put_block(pk.as_bytes()),
            None => w.put_block(&[]),
        }
        w.put_u32(self.skipped.len() as u32);
        for (index, key) in self.skipped.iter() {
            w.put_u32(*index);
            w.put_bytes(key.as_bytes());
        }
        w.into_bytes()
    }

    /// Reconstruct a ratchet from an exported blob
    ///
    /// Rejects unknown versions, truncated input and trailing garbage
    /// with [`Error::State`].
    pub fn import_state(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let version = r.u16().map_err(|_| Error::State)?;
        if version != STATE_VERSION {
            return Err(Error::State);
        }

        let mut root = r.array::<KEY_LEN>().map_err(|_| Error::State)?;
        let mut send_chain = r.array::<KEY_LEN>().map_err(|_| Error::State)?;
        let mut recv_chain = r.array::<KEY_LEN>().map_err(|_| Error::State)?;
        let send_counter = r.u32().map_err(|_| Error::State)?;
        let recv_counter = r.u32().map_err(|_| Error::State)?;
        let mut dh_secret_bytes = r.array::<KEY_LEN>().map_err(|_| Error::State)?;
        let dh_public = PublicKey::from_bytes(r.array::<KEY_LEN>().map_err(|_| Error::State)?);

        let session_block = r.block().map_err(|_| Error::State)?;
        let session_id = if session_block.is_empty() {
            None
        } else {
            Some(session_block.to_vec())
        };

        let remote_block = r.block().map_err(|_| Error::State)?;
        let last_remote_pub = match remote_block.len() {
            0 => None,
            KEY_LEN => Some(PublicKey::from_slice(remote_block).map_err(|_| Error::State)?),
            _ => return Err(Error::State),
        };

        let skipped_count = r.u32().map_err(|_| Error::State)? as usize;
        if skipped_count * SKIPPED_ENTRY_LEN != r.remaining() {
            return Err(Error::State);
        }
        let mut skipped = SkippedKeys::new(MAX_SKIP_DEFAULT as usize);
        for _ in 0..skipped_count {
            let index = r.u32().map_err(|_| Error::State)?;
            let mut key = r.array::<KEY_LEN>().map_err(|_| Error::State)?;
            skipped.insert(index, SymmetricKey::from_bytes(key));
            key.zeroize();
        }

        let ratchet = Self {
            root_key: SymmetricKey::from_bytes(root),
            send_chain_key: SymmetricKey::from_bytes(send_chain),
            recv_chain_key: SymmetricKey::from_bytes(recv_chain),
            send_counter,
            recv_counter,
            dh_secret: SecretKey::from_bytes(dh_secret_bytes),
            dh_public,
            last_remote_pub,
            session_id,
            skipped,
            max_skip: MAX_SKIP_DEFAULT,
        };

        root.zeroize();
        send_chain.zeroize();
        recv_chain.zeroize();
        dh_secret_bytes.zeroize();
        Ok(ratchet)
    }
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("skipped_keys", &self.skipped.len())
            .field("initialized", &self.session_id.is_some())
            .finish()
    }
}

impl Zeroize for Ratchet {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        self.skipped.clear();
    }
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
