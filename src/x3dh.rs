//! X3DH (Extended Triple Diffie-Hellman) initial key agreement.
//!
//! The responder publishes a prekey bundle (identity key, signed prekey,
//! optional one-time prekeys); the initiator combines long-term,
//! medium-term and ephemeral key material into a shared root key:
//!
//! - DH1 = DH(`IK_initiator`, `SPK_responder`)
//! - DH2 = DH(`EPH_initiator`, `IK_responder`)
//! - DH3 = DH(`EPH_initiator`, `SPK_responder`)
//! - DH4 = DH(`EPH_initiator`, `OPK_responder`) when an OPK is used
//! - root = HMAC-SHA-256("X3DHRootKey", DH1 || DH2 || DH3 || DH4?)
//!
//! The responder computes the same combination from the other side. The
//! handshake message exchanged between peers carries public keys, a fresh
//! session id and the role tag only; the root key never goes on the wire.

use crate::crypto::{derive_x3dh_root, SymmetricKey, SESSION_ID_LEN};
use crate::error::{Error, Result};
use crate::keys::{verify_signature, IdentityKeyPair, PublicKey, SecretKey};
use crate::wire::{Reader, Writer};

use ed25519_dalek::Signature;
use rand_core::CryptoRngCore;
use std::collections::HashMap;

/// Default number of one-time prekeys generated per bundle refresh
const DEFAULT_OPK_COUNT: u32 = 100;

/// Side of the handshake a peer is playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Fetched the bundle and opened the session
    Initiator,
    /// Published the bundle and answers the handshake
    Responder,
}

impl Role {
    fn to_wire(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }

    fn from_wire(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Role::Initiator),
            1 => Ok(Role::Responder),
            _ => Err(Error::Codec),
        }
    }
}

/// Initiator-side shared-secret computation
///
/// Fails with [`Error::BadKey`] when any DH produces the all-zero output.
pub fn initiator_secret(
    identity_secret: &SecretKey,
    ephemeral_secret: &SecretKey,
    responder_identity: &PublicKey,
    responder_signed_prekey: &PublicKey,
    responder_one_time_prekey: Option<&PublicKey>,
) -> Result<SymmetricKey> {
    let dh1 = identity_secret.diffie_hellman(responder_signed_prekey)?;
    let dh2 = ephemeral_secret.diffie_hellman(responder_identity)?;
    let dh3 = ephemeral_secret.diffie_hellman(responder_signed_prekey)?;
    let dh4 = match responder_one_time_prekey {
        Some(opk) => Some(ephemeral_secret.diffie_hellman(opk)?),
        None => None,
    };

    Ok(derive_x3dh_root(&dh1, &dh2, &dh3, dh4.as_ref()))
}

/// Responder-side shared-secret computation, symmetric to
/// [`initiator_secret`]
///
/// The one-time prekey secret is taken by value: it is consumed by the
/// computation and wiped when this function returns.
pub fn responder_secret(
    identity_secret: &SecretKey,
    signed_prekey_secret: &SecretKey,
    one_time_prekey_secret: Option<SecretKey>,
    initiator_identity: &PublicKey,
    initiator_ephemeral: &PublicKey,
) -> Result<SymmetricKey> {
    let dh1 = signed_prekey_secret.diffie_hellman(initiator_identity)?;
    let dh2 = identity_secret.diffie_hellman(initiator_ephemeral)?;
    let dh3 = signed_prekey_secret.diffie_hellman(initiator_ephemeral)?;
    let dh4 = match one_time_prekey_secret.as_ref() {
        Some(opk) => Some(opk.diffie_hellman(initiator_ephemeral)?),
        None => None,
    };

    Ok(derive_x3dh_root(&dh1, &dh2, &dh3, dh4.as_ref()))
}

/// Prekey bundle published by a responder
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    /// Responder's long-term identity key
    pub identity_key: PublicKey,
    /// Responder's medium-lived signed prekey
    pub signed_prekey: PublicKey,
    /// Ed25519 signature over the signed prekey
    pub signed_prekey_signature: [u8; 64],
    /// Verifying key for the signature
    pub verifying_key: [u8; 32],
    /// One available one-time prekey, tagged with its id
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Verify the signed-prekey signature
    pub fn verify_signature(&self) -> Result<()> {
        verify_signature(
            &self.verifying_key,
            self.signed_prekey.as_bytes(),
            &self.signed_prekey_signature,
        )
    }
}

/// Responder-side secret state backing a published bundle
///
/// One-time prekey secrets are keyed by id and removed atomically when
/// consumed, so a prekey can never satisfy two handshakes.
pub struct PreKeyState {
    identity_public: PublicKey,
    verifying_key_bytes: [u8; 32],
    signed_prekey: SecretKey,
    signed_prekey_signature: Signature,
    one_time_prekeys: HashMap<u32, SecretKey>,
}

impl PreKeyState {
    /// Generate prekey state with the default one-time prekey count
    pub fn generate<R: CryptoRngCore>(rng: &mut R, identity: &IdentityKeyPair) -> Self {
        Self::generate_with_count(rng, identity, DEFAULT_OPK_COUNT)
    }

    /// Generate prekey state with a specific one-time prekey count
    pub fn generate_with_count<R: CryptoRngCore>(
        rng: &mut R,
        identity: &IdentityKeyPair,
        opk_count: u32,
    ) -> Self {
        let signed_prekey = SecretKey::generate(rng);
        let signed_prekey_signature = identity
            .signing_key
            .sign(signed_prekey.public_key().as_bytes());

        let one_time_prekeys = (0..opk_count)
            .map(|id| (id, SecretKey::generate(rng)))
            .collect();

        Self {
            identity_public: identity.public_key(),
            verifying_key_bytes: identity.signing_key.verifying_key_bytes(),
            signed_prekey,
            signed_prekey_signature,
            one_time_prekeys,
        }
    }

    /// Create the public bundle for distribution
    ///
    /// Advertises the lowest-numbered one-time prekey still available.
    #[must_use]
    pub fn public_bundle(&self) -> PreKeyBundle {
        let one_time_prekey = self
            .one_time_prekeys
            .iter()
            .min_by_key(|(id, _)| **id)
            .map(|(id, key)| (*id, key.public_key()));

        PreKeyBundle {
            identity_key: self.identity_public,
            signed_prekey: self.signed_prekey.public_key(),
            signed_prekey_signature: self.signed_prekey_signature.to_bytes(),
            verifying_key: self.verifying_key_bytes,
            one_time_prekey,
        }
    }

    /// Atomically remove and return the one-time prekey with the given id
    pub fn consume_one_time_prekey(&mut self, id: u32) -> Result<SecretKey> {
        self.one_time_prekeys
            .remove(&id)
            .ok_or(Error::MissingOneTimePrekey)
    }

    /// Number of one-time prekeys still available
    #[must_use]
    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }
}

impl std::fmt::Debug for PreKeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyState")
            .field("identity_public", &self.identity_public)
            .field("one_time_prekey_count", &self.one_time_prekeys.len())
            .finish()
    }
}

/// Handshake message sent from initiator to responder
///
/// Carries everything the responder needs to run its half of the
/// agreement. The root key itself never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Fresh random session identifier for the handshake
    pub session_id: [u8; SESSION_ID_LEN],
    /// Which side produced this message
    pub role: Role,
    /// Sender's identity key
    pub identity_key: PublicKey,
    /// Sender's ephemeral key
    pub ephemeral_key: PublicKey,
    /// Id of the one-time prekey consumed from the bundle, if any
    pub used_one_time_prekey: Option<u32>,
}

impl HandshakeMessage {
    /// Serialize to the wire format
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(1 + SESSION_ID_LEN + 64 + 5);
        w.put_bytes(&[self.role.to_wire()]);
        w.put_bytes(&self.session_id);
        w.put_bytes(self.identity_key.as_bytes());
        w.put_bytes(self.ephemeral_key.as_bytes());
        match self.used_one_time_prekey {
            Some(id) => {
                w.put_bytes(&[1]);
                w.put_u32(id);
            }
            None => w.put_bytes(&[0]),
        }
        w.into_bytes()
    }

    /// Deserialize from the wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let role = Role::from_wire(r.array::<1>()?[0])?;
        let session_id = r.array::<SESSION_ID_LEN>()?;
        let identity_key = PublicKey::from_bytes(r.array::<32>()?);
        let ephemeral_key = PublicKey::from_bytes(r.array::<32>()?);
        let used_one_time_prekey = match r.array::<1>()?[0] {
            0 => None,
            1 => Some(r.u32()?),
            _ => return Err(Error::Codec),
        };

        Ok(Self {
            session_id,
            role,
            identity_key,
            ephemeral_key,
            used_one_time_prekey,
        })
    }
}

/// Result of the initiator's handshake computation
pub struct InitiatorResult {
    /// Shared root key for ratchet initialization
    pub root_key: SymmetricKey,
    /// Handshake message to deliver to the responder
    pub handshake: HandshakeMessage,
}

impl std::fmt::Debug for InitiatorResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorResult")
            .field("handshake", &self.handshake)
            .finish()
    }
}

/// Result of the responder's handshake computation
pub struct ResponderResult {
    /// Shared root key for ratchet initialization
    pub root_key: SymmetricKey,
    /// Session id adopted from the initiator's handshake
    pub session_id: [u8; SESSION_ID_LEN],
}

impl std::fmt::Debug for ResponderResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderResult")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Run the initiator side of the handshake against a published bundle
///
/// Verifies the signed-prekey signature, generates a fresh ephemeral key
/// and derives the root key.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorResult> {
    bundle.verify_signature()?;

    let ephemeral = SecretKey::generate(rng);
    let opk_public = bundle.one_time_prekey.as_ref().map(|(_, pk)| pk);

    let root_key = initiator_secret(
        &identity.dh_key,
        &ephemeral,
        &bundle.identity_key,
        &bundle.signed_prekey,
        opk_public,
    )?;

    let mut session_id = [0u8; SESSION_ID_LEN];
    rng.fill_bytes(&mut session_id);

    let handshake = HandshakeMessage {
        session_id,
        role: Role::Initiator,
        identity_key: identity.public_key(),
        ephemeral_key: ephemeral.public_key(),
        used_one_time_prekey: bundle.one_time_prekey.as_ref().map(|(id, _)| *id),
    };

    Ok(InitiatorResult {
        root_key,
        handshake,
    })
}

/// Run the responder side of the handshake
///
/// If the initiator used a one-time prekey, its secret is removed from
/// `state` before the computation and destroyed with it.
pub fn respond(
    state: &mut PreKeyState,
    identity: &IdentityKeyPair,
    handshake: &HandshakeMessage,
) -> Result<ResponderResult> {
    if handshake.role != Role::Initiator {
        return Err(Error::Codec);
    }

    let opk_secret = match handshake.used_one_time_prekey {
        Some(id) => Some(state.consume_one_time_prekey(id)?),
        None => None,
    };

    let root_key = responder_secret(
        &identity.dh_key,
        &state.signed_prekey,
        opk_secret,
        &handshake.identity_key,
        &handshake.ephemeral_key,
    )?;

    Ok(ResponderResult {
        root_key,
        session_id: handshake.session_id,
    })
}
