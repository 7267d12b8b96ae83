//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Wraps the cipher selected by [`CipherKind`] behind one interface. Every
//! tunnel frame is sealed with the per-session subkey and a counter nonce.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305, Nonce as NonceBytes,
};

use crate::crypto::{CipherKind, SessionKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A nonce (number used once) for AEAD operations.
///
/// The tunnel uses a 96-bit little-endian counter starting at zero and
/// incremented after every seal/open, one sequence per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a 64-bit counter value.
    ///
    /// The counter occupies the first 8 bytes (little-endian); the remaining
    /// 4 bytes are the high part of the 96-bit counter and start at zero.
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Get the low 64 bits of the counter (for diagnostics).
    pub fn counter(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(low)
    }

    /// Increment the whole 96-bit little-endian counter.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

impl From<u64> for Nonce {
    fn from(counter: u64) -> Self {
        Self::new(counter)
    }
}

/// AEAD cipher instance bound to one subkey.
pub enum Aead {
    /// AES-128-GCM
    Aes128Gcm(Box<Aes128Gcm>),
    /// AES-256-GCM
    Aes256Gcm(Box<Aes256Gcm>),
    /// ChaCha20-Poly1305
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl Aead {
    /// Create a new AEAD instance for `kind` with the given subkey.
    pub fn new(kind: CipherKind, key: &SessionKey) -> Result<Self> {
        let key = key.as_bytes();
        if key.len() != kind.key_len() {
            return Err(Error::Buffer {
                expected: kind.key_len(),
                actual: key.len(),
            });
        }

        let invalid = || Error::crypto(format!("invalid {} key", kind));
        Ok(match kind {
            CipherKind::Aes128Gcm => Aead::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| invalid())?,
            )),
            CipherKind::Aes256Gcm => Aead::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| invalid())?,
            )),
            CipherKind::ChaCha20Poly1305 => Aead::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid())?,
            )),
        })
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let nonce = NonceBytes::from_slice(nonce.as_bytes());

        let sealed = match self {
            Aead::Aes128Gcm(c) => c.encrypt(nonce, payload),
            Aead::Aes256Gcm(c) => c.encrypt(nonce, payload),
            Aead::ChaCha20Poly1305(c) => c.encrypt(nonce, payload),
        };
        sealed.map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, tampered data, etc.)
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let nonce = NonceBytes::from_slice(nonce.as_bytes());

        let opened = match self {
            Aead::Aes128Gcm(c) => c.decrypt(nonce, payload),
            Aead::Aes256Gcm(c) => c.decrypt(nonce, payload),
            Aead::ChaCha20Poly1305(c) => c.decrypt(nonce, payload),
        };
        opened.map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}
