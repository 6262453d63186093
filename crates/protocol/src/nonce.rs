//! Payload nonce
//!
//! A nonce identifies one transmission of a payload and correlates the
//! acknowledgements sent back for it.

use std::fmt;

use rand::RngCore;

use crate::error::ProtocolError;

/// Length of a nonce in bytes
pub const NONCE_LENGTH: usize = 16;

/// 16-byte random payload identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    /// Generate a random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; NONCE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build a nonce from a slice that must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let array: [u8; NONCE_LENGTH] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidNonceLength(bytes.len()))?;
        Ok(Self(array))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }

    /// Lowercase hex form, used in stream-load labels and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_nonces_differ() {
        assert_ne!(Nonce::random(), Nonce::random());
    }

    #[test]
    fn test_from_slice() {
        let bytes = [7u8; 16];
        assert_eq!(Nonce::from_slice(&bytes).unwrap(), Nonce::from_bytes(bytes));
        assert!(matches!(
            Nonce::from_slice(&bytes[..15]),
            Err(ProtocolError::InvalidNonceLength(15))
        ));
    }

    #[test]
    fn test_hex_display() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        let nonce = Nonce::from_bytes(bytes);
        assert_eq!(nonce.to_string(), "ab000000000000000000000000000001");
    }
}
