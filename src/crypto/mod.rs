// Cryptographic primitives for the Goster session layer.
// Numan Thabit 2025

pub mod aead;
pub mod handshake;
pub mod nonce;
