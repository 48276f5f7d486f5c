//! Group-session routing stub.
//!
//! Group messaging is out of scope for the core; this registry only lets
//! the dispatcher recognize envelopes that belong to a group epoch so it
//! can divert them away from the 1:1 ratchet path. No group cryptography
//! is performed.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Session-id to group-epoch map consulted on the inbound path
#[derive(Debug, Default)]
pub struct GroupRegistry {
    epochs: Mutex<HashMap<Vec<u8>, u64>>,
}

impl GroupRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session id as belonging to a group epoch
    ///
    /// Matching inbound envelopes are diverted and dropped until group
    /// messaging is implemented.
    pub fn set_epoch(&self, session_id: &[u8], epoch: u64) {
        self.lock().insert(session_id.to_vec(), epoch);
    }

    /// Epoch registered for a session id, if any
    #[must_use]
    pub fn epoch(&self, session_id: &[u8]) -> Option<u64> {
        self.lock().get(session_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, u64>> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_lookup() {
        let registry = GroupRegistry::new();
        assert_eq!(registry.epoch(b"group-1"), None);

        registry.set_epoch(b"group-1", 3);
        assert_eq!(registry.epoch(b"group-1"), Some(3));
        assert_eq!(registry.epoch(b"group-2"), None);
    }
}
