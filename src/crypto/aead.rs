// AES-256-GCM payload protection with the frame header as associated data.
// Numan Thabit 2025

use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, KeyInit, Nonce,
};
use thiserror::Error;

/// Session key length (AES-256).
pub const KEY_LEN: usize = 32;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// GCM nonce length carried in the frame header.
pub const NONCE_LEN: usize = 12;

/// Symmetric session key. The X25519 shared secret is used directly,
/// without a KDF, to stay byte-compatible with the server.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Errors returned by the AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Decryption or tag verification failed.
    #[error("decryption failed")]
    Decrypt,
    /// Ciphertext shorter than the authentication tag.
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Encrypts `plaintext`, returning ciphertext concatenated with the tag.
///
/// A zero-length plaintext is valid and yields a tag over the AAD alone.
pub fn seal(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if ciphertext.len() < TAG_LEN {
        return Err(AeadError::CiphertextTooShort(ciphertext.len()));
    }
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = SessionKey::from_bytes([0x11; KEY_LEN]);
        let nonce = [0x22; NONCE_LEN];
        let aad = b"header-prefix";
        let plaintext = b"hello goster";

        let ciphertext = seal(&key, &nonce, aad, plaintext).expect("seal");
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let recovered = open(&key, &nonce, aad, &ciphertext).expect("open");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn empty_payload_authenticates_aad() {
        let key = SessionKey::from_bytes([0x33; KEY_LEN]);
        let nonce = [0x44; NONCE_LEN];
        let aad = b"aad-only";

        let ciphertext = seal(&key, &nonce, aad, b"").expect("seal");
        assert_eq!(ciphertext.len(), TAG_LEN);

        let recovered = open(&key, &nonce, aad, &ciphertext).expect("open");
        assert!(recovered.is_empty());

        assert_eq!(
            open(&key, &nonce, b"other-aad", &ciphertext),
            Err(AeadError::Decrypt)
        );
    }

    #[test]
    fn tampered_bytes_are_rejected() {
        let key = SessionKey::from_bytes([0x55; KEY_LEN]);
        let nonce = [0x66; NONCE_LEN];
        let aad = b"aad";
        let ciphertext = seal(&key, &nonce, aad, b"payload bytes").expect("seal");

        for index in 0..ciphertext.len() {
            let mut corrupted = ciphertext.clone();
            corrupted[index] ^= 0x01;
            assert_eq!(
                open(&key, &nonce, aad, &corrupted),
                Err(AeadError::Decrypt),
                "flip at byte {index} must fail authentication"
            );
        }
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let key = SessionKey::from_bytes([0x77; KEY_LEN]);
        assert_eq!(
            open(&key, &[0u8; NONCE_LEN], b"", &[0u8; TAG_LEN - 1]),
            Err(AeadError::CiphertextTooShort(TAG_LEN - 1))
        );
    }
}
