//! Self-describing wire frame for encrypted messages.
//!
//! Serialization is a flat big-endian concatenation; variable-length
//! fields carry a `u32` byte-count prefix. Trailing bytes after the last
//! field are accepted so older readers keep working when fields are
//! appended.

use crate::error::{Error, Result};
use crate::wire::{Reader, Writer};

/// Encrypted message frame plus routing metadata
///
/// `associated_data` is the ratchet header, bound into the AEAD tag; the
/// `message_index`/`previous_counter` copies here are unauthenticated and
/// carried for routing and audit only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session identifier (16 bytes for 1:1 sessions)
    pub session_id: Vec<u8>,
    /// Sender's send counter at encryption time
    pub message_index: u32,
    /// Sender's receive counter at encryption time
    pub previous_counter: u32,
    /// Milliseconds since the Unix epoch, informational only
    pub timestamp: u64,
    /// Device id of the sender
    pub sender_device_id: String,
    /// Ratchet header, authenticated as AAD
    pub associated_data: Vec<u8>,
    /// AEAD output: `nonce || ct || tag`
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize to the wire format
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let cap = 4 * 4
            + 8
            + self.session_id.len()
            + self.sender_device_id.len()
            + self.associated_data.len()
            + self.ciphertext.len();
        let mut w = Writer::with_capacity(cap);

        w.put_block(&self.session_id);
        w.put_u32(self.message_index);
        w.put_u32(self.previous_counter);
        w.put_u64(self.timestamp);
        w.put_block(self.sender_device_id.as_bytes());
        w.put_block(&self.associated_data);
        w.put_block(&self.ciphertext);
        w.into_bytes()
    }

    /// Deserialize from the wire format
    ///
    /// Fails with [`Error::Codec`] on truncated input, a length field
    /// exceeding the remaining bytes, or a non-UTF-8 device id. Bytes
    /// after the last field are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let session_id = r.block()?.to_vec();
        let message_index = r.u32()?;
        let previous_counter = r.u32()?;
        let timestamp = r.u64()?;
        let sender_device_id = std::str::from_utf8(r.block()?)
            .map_err(|_| Error::Codec)?
            .to_owned();
        let associated_data = r.block()?.to_vec();
        let ciphertext = r.block()?.to_vec();

        Ok(Self {
            session_id,
            message_index,
            previous_counter,
            timestamp,
            sender_device_id,
            associated_data,
            ciphertext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            session_id: b"session123".to_vec(),
            message_index: 100,
            previous_counter: 99,
            timestamp: 1_234_567_890,
            sender_device_id: "device1".to_owned(),
            associated_data: b"associated-data".to_vec(),
            ciphertext: b"this is a ciphertext blob".to_vec(),
        }
    }

    #[test]
    fn test_roundtrip_is_byte_exact() {
        let env = sample();
        let bytes = env.to_bytes();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.to_bytes(), bytes);
    }

    #[test]
    fn test_empty_fields_roundtrip() {
        let env = Envelope {
            session_id: Vec::new(),
            message_index: 0,
            previous_counter: 0,
            timestamp: 0,
            sender_device_id: String::new(),
            associated_data: Vec::new(),
            ciphertext: Vec::new(),
        };
        assert_eq!(Envelope::from_bytes(&env.to_bytes()).unwrap(), env);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = sample().to_bytes();
        for cut in [0, 1, 3, 10, bytes.len() - 1] {
            assert_eq!(
                Envelope::from_bytes(&bytes[..cut]).unwrap_err(),
                Error::Codec
            );
        }
    }

    #[test]
    fn test_oversized_length_field_rejected() {
        let mut bytes = sample().to_bytes();
        // inflate the session-id length prefix past the buffer
        bytes[0] = 0xFF;
        assert_eq!(Envelope::from_bytes(&bytes).unwrap_err(), Error::Codec);
    }

    #[test]
    fn test_invalid_utf8_device_id_rejected() {
        let mut env = sample();
        env.sender_device_id = "ab".to_owned();
        let mut bytes = env.to_bytes();
        // 4 + 10 (sid) + 4 + 4 + 8 + 4 = offset of the device id bytes
        let off = 4 + env.session_id.len() + 4 + 4 + 8 + 4;
        bytes[off] = 0xFF;
        assert_eq!(Envelope::from_bytes(&bytes).unwrap_err(), Error::Codec);
    }

    #[test]
    fn test_trailing_bytes_accepted() {
        let env = sample();
        let mut bytes = env.to_bytes();
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }
}
