// Numan Thabit 2025
// crypto/handshake.rs - X25519 session key agreement

use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::aead::SessionKey;

/// X25519 public key length on the wire (canonical RFC 7748 little-endian).
pub const PUBLIC_KEY_LEN: usize = 32;

/// Errors produced while mixing the peer key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer public key was not exactly 32 bytes.
    #[error("peer public key has invalid length {0}")]
    PeerKeyLength(usize),
    /// The shared secret reduced to all zeros (small-order peer point).
    #[error("non-contributory peer public key")]
    NonContributory,
}

/// Ephemeral X25519 keypair generated once per server session.
pub struct Keypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns the public key bytes emitted in HANDSHAKE_INIT.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Mixes the peer public key into a session key, consuming the secret.
    ///
    /// The raw shared secret becomes the AES-256 key directly; the server
    /// applies the same convention, so both sides must skip the KDF.
    pub fn diffie_hellman(self, peer: &[u8]) -> Result<SessionKey, HandshakeError> {
        let peer_bytes: [u8; PUBLIC_KEY_LEN] = peer
            .try_into()
            .map_err(|_| HandshakeError::PeerKeyLength(peer.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_bytes));
        if !shared.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }
        Ok(SessionKey::from_bytes(shared.to_bytes()))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_bytes())
            .finish_non_exhaustive()
    }
}
