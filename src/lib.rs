//! # peerseal
//!
//! Cryptographic messaging core for secure peer-to-peer communication:
//! X3DH-style initial key agreement, a double-ratchet session state
//! machine with out-of-order delivery, and a dispatcher that frames
//! encrypted messages into self-describing envelopes and drives an
//! abstract transport.
//!
//! ## Security Properties
//!
//! - **Confidentiality & authenticity**: every message is sealed with
//!   ChaCha20-Poly1305, with the ratchet header bound as associated data
//! - **Forward secrecy**: chain keys evolve per message and the root key
//!   evolves per DH step; old state cannot read new traffic
//! - **Out-of-order tolerance**: skipped message keys are cached, up to a
//!   configurable bound
//!
//! ## Threat Model
//!
//! The transport is fully adversarial: frames may be injected, modified,
//! reordered, replayed or dropped. Failed decryptions never mutate
//! session state. X25519, HMAC-SHA-256 and the AEAD are assumed sound.
//! Key material is wiped on drop, but side channels are not formally
//! verified.
//!
//! ## Usage
//!
//! ```no_run
//! use peerseal::{Dispatcher, MemoryTransport};
//! use std::sync::Arc;
//!
//! let (wire_a, wire_b) = MemoryTransport::pair();
//!
//! let alice = Dispatcher::new(Arc::new(wire_a));
//! alice.register_device("alice");
//! alice.create_session_with("bob", &[5u8; 32]).unwrap();
//!
//! let bob = Dispatcher::new(Arc::new(wire_b));
//! bob.register_device("bob");
//! bob.create_session_with("alice", &[5u8; 32]).unwrap();
//! bob.set_on_inbound(Arc::new(|msg| {
//!     println!("{}: {} bytes", msg.sender_device_id, msg.plaintext.len());
//! }));
//!
//! alice.start();
//! bob.start();
//! alice.send("bob", b"Hi Bob").unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod crypto;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod group;
pub mod keys;
pub mod ratchet;
pub mod session;
pub mod transport;
pub(crate) mod wire;
pub mod x3dh;

// Re-export main types
pub use dispatcher::{Dispatcher, InboundCallback, InboundMessage, SessionStats};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use keys::{IdentityKeyPair, PublicKey, SecretKey, SigningKeyPair};
pub use ratchet::Ratchet;
pub use transport::{MemoryTransport, Transport};
pub use x3dh::{HandshakeMessage, InitiatorResult, PreKeyBundle, PreKeyState, ResponderResult, Role};
