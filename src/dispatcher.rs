//! Message dispatcher: device registration, session ownership, envelope
//! framing and transport glue.
//!
//! The dispatcher is called from two contexts: application threads on the
//! send path, and the transport's worker thread on the receive path. The
//! session table mutex serializes both; `transport.send` is invoked
//! strictly outside that critical section, and the inbound callback runs
//! after the table lock has been released. Inbound failures are logged
//! and dropped, never propagated into the transport.

use crate::crypto::derive_session_id;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::group::GroupRegistry;
use crate::keys::KEY_LEN;
use crate::ratchet::Ratchet;
use crate::session::SessionTable;
use crate::transport::Transport;

use rand_core::OsRng;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Decrypted inbound message handed to the application callback
pub struct InboundMessage {
    /// Device id of the sending peer
    pub sender_device_id: String,
    /// Session the message belongs to
    pub session_id: Vec<u8>,
    /// Authenticated message index within the sender's chain
    pub message_index: u32,
    /// Sender-reported timestamp in milliseconds, informational only
    pub timestamp: u64,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("sender_device_id", &self.sender_device_id)
            .field("message_index", &self.message_index)
            .field("plaintext_len", &self.plaintext.len())
            .finish()
    }
}

/// Application callback for decrypted inbound messages
pub type InboundCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Point-in-time snapshot of one session's ratchet progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages sent in the current chain
    pub send_counter: u32,
    /// Messages received in the current chain
    pub recv_counter: u32,
    /// Message keys cached for out-of-order delivery
    pub skipped_keys: usize,
}

struct Shared {
    device_id: Mutex<String>,
    sessions: SessionTable,
    on_inbound: Mutex<Option<InboundCallback>>,
    groups: GroupRegistry,
}

impl Shared {
    fn lock_device_id(&self) -> std::sync::MutexGuard<'_, String> {
        self.device_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_on_inbound(&self) -> std::sync::MutexGuard<'_, Option<InboundCallback>> {
        self.on_inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive path: transport worker thread enters here
    fn on_raw_message(&self, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(_) => {
                debug!(len = bytes.len(), "dropping undecodable inbound frame");
                return;
            }
        };

        if let Some(epoch) = self.groups.epoch(&envelope.session_id) {
            debug!(epoch, "dropping group frame: group messaging not implemented");
            return;
        }

        // no implicit session creation: unknown senders are dropped
        let sender = envelope.sender_device_id.clone();
        let result = self
            .sessions
            .with_session(&sender, |ratchet| ratchet.decrypt(&envelope));

        let plaintext = match result {
            Ok(plaintext) => plaintext,
            Err(Error::NoSession) => {
                debug!(sender = %sender, "dropping inbound frame from unknown peer");
                return;
            }
            Err(error) => {
                debug!(sender = %sender, %error, "dropping undecryptable inbound frame");
                return;
            }
        };

        // table lock is released; clone the callback out of its own lock
        // before invoking user code
        let callback = self.lock_on_inbound().clone();
        match callback {
            Some(callback) => callback(InboundMessage {
                sender_device_id: sender,
                session_id: envelope.session_id,
                message_index: envelope.message_index,
                timestamp: envelope.timestamp,
                plaintext,
            }),
            None => debug!(sender = %sender, "inbound message decrypted but no callback installed"),
        }
    }
}

/// Owns one ratchet session per remote peer and drives a transport
pub struct Dispatcher {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    /// Create a dispatcher on top of a transport
    ///
    /// Installs the inbound hook immediately; datagrams are only consumed
    /// once the transport is started.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            device_id: Mutex::new(String::new()),
            sessions: SessionTable::new(),
            on_inbound: Mutex::new(None),
            groups: GroupRegistry::new(),
        });

        let hook = Arc::clone(&shared);
        transport.set_on_message(Arc::new(move |bytes| hook.on_raw_message(&bytes)));

        Self { shared, transport }
    }

    /// Set the local device id
    ///
    /// Sessions created afterwards derive their session id from this
    /// value; re-registering once sessions exist is almost certainly a
    /// bug and is logged.
    pub fn register_device(&self, device_id: &str) {
        let mut current = self.shared.lock_device_id();
        if !self.shared.sessions.is_empty() && *current != device_id {
            warn!(
                old = %current,
                new = device_id,
                "device re-registered with active sessions"
            );
        }
        *current = device_id.to_owned();
    }

    /// Create (or replace) the session for a peer from a shared root key
    ///
    /// The session id is derived deterministically from the sorted device
    /// ids and the root key, so both peers agree on it without any
    /// exchange. Fails with [`Error::BadKey`] unless the root key is
    /// exactly 32 bytes.
    pub fn create_session_with(&self, peer_id: &str, root_key: &[u8]) -> Result<()> {
        let root: [u8; KEY_LEN] = root_key.try_into().map_err(|_| Error::BadKey)?;

        let local_id = self.shared.lock_device_id().clone();
        let session_id = derive_session_id(&local_id, peer_id, &root);

        let mut ratchet = Ratchet::new(&mut OsRng);
        ratchet.initialize(&root, &session_id);
        self.shared.sessions.insert(peer_id, ratchet);

        debug!(peer = peer_id, "session created");
        Ok(())
    }

    /// Encrypt and send a message to a peer
    ///
    /// Fails with [`Error::NoSession`] for unknown peers and
    /// [`Error::SendFailed`] when the transport rejects the frame. Does
    /// not block on network I/O: the envelope is encrypted and serialized
    /// under the session lock, then handed to the transport outside it.
    pub fn send(&self, peer_id: &str, plaintext: &[u8]) -> Result<()> {
        let local_id = self.shared.lock_device_id().clone();

        let bytes = self.shared.sessions.with_session(peer_id, |ratchet| {
            let mut envelope = ratchet.encrypt(plaintext)?;
            envelope.sender_device_id = local_id;
            Ok(envelope.to_bytes())
        })?;

        self.transport.send(bytes)
    }

    /// Install the callback for decrypted inbound messages
    pub fn set_on_inbound(&self, callback: InboundCallback) {
        *self.shared.lock_on_inbound() = Some(callback);
    }

    /// Tear down the session for one peer; returns whether one existed
    ///
    /// The dropped ratchet wipes its key material.
    pub fn remove_session(&self, peer_id: &str) -> bool {
        self.shared.sessions.remove(peer_id)
    }

    /// Snapshot a session's counters and cache size
    ///
    /// Fails with [`Error::NoSession`] for unknown peers.
    pub fn session_stats(&self, peer_id: &str) -> Result<SessionStats> {
        self.shared.sessions.with_session(peer_id, |ratchet| {
            Ok(SessionStats {
                send_counter: ratchet.send_counter(),
                recv_counter: ratchet.recv_counter(),
                skipped_keys: ratchet.skipped_key_count(),
            })
        })
    }

    /// Group-epoch registry consulted on the inbound path
    #[must_use]
    pub fn groups(&self) -> &GroupRegistry {
        &self.shared.groups
    }

    /// Start the underlying transport
    pub fn start(&self) {
        self.transport.start();
    }

    /// Stop the transport and destroy all sessions
    ///
    /// Idempotent; joins the transport worker and wipes every ratchet.
    pub fn stop(&self) {
        self.transport.stop();
        self.shared.sessions.clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("device_id", &*self.shared.lock_device_id())
            .field("sessions", &self.shared.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_send_without_session_fails() {
        let (left, _right) = MemoryTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(left));
        dispatcher.register_device("alice");

        assert_eq!(
            dispatcher.send("bob", b"hello").unwrap_err(),
            Error::NoSession
        );
    }

    #[test]
    fn test_root_key_must_be_32_bytes() {
        let (left, _right) = MemoryTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(left));
        dispatcher.register_device("alice");

        assert_eq!(
            dispatcher.create_session_with("bob", &[5u8; 31]).unwrap_err(),
            Error::BadKey
        );
        assert!(dispatcher.create_session_with("bob", &[5u8; 32]).is_ok());
    }

    #[test]
    fn test_remove_session() {
        let (left, _right) = MemoryTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(left));
        dispatcher.register_device("alice");
        dispatcher.create_session_with("bob", &[5u8; 32]).unwrap();

        assert!(dispatcher.remove_session("bob"));
        assert!(!dispatcher.remove_session("bob"));
        assert_eq!(
            dispatcher.send("bob", b"hello").unwrap_err(),
            Error::NoSession
        );
    }

    #[test]
    fn test_stop_destroys_sessions() {
        let (left, _right) = MemoryTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(left));
        dispatcher.register_device("alice");
        dispatcher.create_session_with("bob", &[5u8; 32]).unwrap();

        dispatcher.stop();
        assert_eq!(
            dispatcher.send("bob", b"hello").unwrap_err(),
            Error::NoSession
        );
    }
}
