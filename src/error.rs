//! Error types surfaced by the messaging core.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during session setup, encryption and dispatch
///
/// Inbound-path failures are logged and dropped by the dispatcher; only
/// caller-facing operations propagate these. Error messages never contain
/// key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No session exists for the requested peer
    #[error("no session for peer")]
    NoSession,

    /// Envelope session id does not match the local session
    #[error("session id mismatch")]
    SessionMismatch,

    /// AEAD tag verification failed or the ratchet header is malformed
    #[error("authentication failed")]
    Authentication,

    /// Skipped-message gap exceeds the configured bound
    #[error("skipped-message gap exceeds bound")]
    Flood,

    /// Envelope or handshake bytes could not be decoded
    #[error("malformed frame")]
    Codec,

    /// Public key has the wrong size or produced a low-order DH output
    #[error("invalid public key")]
    BadKey,

    /// Signed-prekey signature did not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Responder has no one-time prekey under the requested id
    #[error("missing one-time prekey")]
    MissingOneTimePrekey,

    /// Transport rejected the outbound frame
    #[error("transport send failed")]
    SendFailed,

    /// Exported state blob has an unknown version or invalid length
    #[error("invalid state blob")]
    State,

    /// Ratchet used before `initialize`
    #[error("session not initialized")]
    NotInitialized,

    /// Internal cryptographic failure
    #[error("cryptographic error")]
    Crypto,
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::InvalidSignature
    }
}
