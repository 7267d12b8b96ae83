//! Key Derivation Functions.
//!
//! A node's password is stretched into a master key once at load time
//! (OpenSSL `EVP_BytesToKey` with MD5, as every Shadowsocks implementation
//! does). Each stream direction then derives its own subkey from the master
//! key and that direction's salt with HKDF-SHA1.

use hkdf::Hkdf as HkdfImpl;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{CipherKind, SUBKEY_INFO};
use crate::error::{Error, Result};

/// HKDF key derivation using SHA-1.
pub struct Hkdf {
    prk: HkdfImpl<Sha1>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - The stream salt
    /// * `ikm` - Input keying material (the master key)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand the PRK to produce output keying material.
    pub fn expand(&self, info: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut okm = vec![0u8; len];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }
}

/// Master key derived from a node's pre-shared password.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    /// Derive the master key for `cipher` from a password.
    pub fn from_password(password: &str, cipher: CipherKind) -> Self {
        Self(evp_bytes_to_key(password.as_bytes(), cipher.key_len()))
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("len", &self.0.len()).finish()
    }
}

/// Per-stream subkey.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Derive the subkey for one stream direction.
    ///
    /// The subkey has the same length as the master key.
    pub fn derive(master: &MasterKey, salt: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::new(Some(salt), master.as_bytes());
        Ok(Self(hkdf.expand(SUBKEY_INFO, master.as_bytes().len())?))
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5, one iteration and no salt.
///
/// `D_i = MD5(D_{i-1} || password)`, concatenated until `key_len` bytes.
fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }

    prev.zeroize();
    key.truncate(key_len);
    key
}
