//! Cryptographic primitives for the tunnel protocol.
//!
//! This module provides:
//! - The supported AEAD cipher kinds (AES-GCM and ChaCha20-Poly1305)
//! - Counter-based nonces, one sequence per stream direction
//! - Password to master key derivation and per-session subkeys (HKDF-SHA1)
//! - Secure random number generation for salts
//!
//! Key material is zeroized on drop.

mod aead;
mod cipher;
mod kdf;
mod random;

pub use aead::{Aead, Nonce};
pub use cipher::CipherKind;
pub use kdf::{Hkdf, MasterKey, SessionKey};
pub use random::SecureRandom;

/// Size of AEAD nonce in bytes (96 bits for every supported cipher)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// HKDF info string for per-session subkeys
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";
