//! Per-peer session table.
//!
//! One ratchet per remote device id, behind a single table mutex. All
//! per-session mutation goes through [`SessionTable::with_session`], so
//! encrypt and decrypt for one session are serialized. Callers must not
//! perform blocking I/O inside the closure.

use crate::error::{Error, Result};
use crate::ratchet::Ratchet;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Device-id keyed map of ratchet sessions
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Ratchet>>,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Ratchet>> {
        // mutation is transactional per call, so a poisoned map is still
        // internally consistent
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the session for a peer
    ///
    /// A replaced ratchet is dropped, which wipes its key material.
    pub fn insert(&self, peer_id: &str, ratchet: Ratchet) {
        self.lock().insert(peer_id.to_owned(), ratchet);
    }

    /// Remove a peer's session; returns whether one existed
    pub fn remove(&self, peer_id: &str) -> bool {
        self.lock().remove(peer_id).is_some()
    }

    /// Whether a session exists for the peer
    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.lock().contains_key(peer_id)
    }

    /// Number of active sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop all sessions, wiping their key material
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Run `f` against the peer's ratchet under the table lock
    ///
    /// Fails with [`Error::NoSession`] when the peer is unknown.
    pub fn with_session<T>(
        &self,
        peer_id: &str,
        f: impl FnOnce(&mut Ratchet) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.lock();
        let ratchet = sessions.get_mut(peer_id).ok_or(Error::NoSession)?;
        f(ratchet)
    }
}
