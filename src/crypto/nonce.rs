// Numan Thabit 2025
// crypto/nonce.rs - per-session monotonic nonce sequence

use rand::RngCore;
use thiserror::Error;

/// Nonce length carried in the frame header.
pub const NONCE_LEN: usize = 12;

/// Salt length occupying nonce bytes 0..4.
pub const SALT_LEN: usize = 4;

/// Error raised when the sequence space is exhausted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    /// The 64-bit counter rolled over; the session must be torn down.
    #[error("nonce counter exhausted")]
    Exhausted,
}

/// Session-scoped nonce generator.
///
/// Bytes 0..4 carry a salt that stays constant for the session (zero by
/// default), bytes 4..12 the little-endian counter. The counter increments
/// before every emission, so no two frames under one key share a nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSeq {
    salt: [u8; SALT_LEN],
    counter: u64,
}

impl NonceSeq {
    /// Creates a sequence with a zero salt, matching the device default.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            salt: [0u8; SALT_LEN],
            counter: 0,
        }
    }

    /// Creates a sequence with a random salt held constant for the session.
    pub fn with_random_salt() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { salt, counter: 0 }
    }

    /// Returns the next nonce, or [`NonceError::Exhausted`] on rollover.
    pub fn next(&mut self) -> Result<[u8; NONCE_LEN], NonceError> {
        self.counter = self.counter.checked_add(1).ok_or(NonceError::Exhausted)?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&self.counter.to_le_bytes());
        Ok(nonce)
    }

    /// Returns the last emitted counter value.
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.counter
    }
}

impl Default for NonceSeq {
    fn default() -> Self {
        Self::new()
    }
}
