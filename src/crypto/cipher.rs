//! Supported tunnel ciphers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// AEAD cipher selected per node by its cipher identifier.
///
/// The identifier determines key length and salt length (always equal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CipherKind {
    /// AES-128-GCM
    Aes128Gcm,
    /// AES-256-GCM
    Aes256Gcm,
    /// ChaCha20-Poly1305 (IETF variant, 96-bit nonce)
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Canonical identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length in bytes, sent in the clear at the start of each stream.
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }
}

impl TryFrom<String> for CipherKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CipherKind> for String {
    fn from(kind: CipherKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
