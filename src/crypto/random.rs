//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source.

use rand::rngs::OsRng;
use rand::RngCore;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a fresh stream salt of `len` bytes.
    pub fn salt(len: usize) -> Vec<u8> {
        let mut salt = vec![0u8; len];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_random_bytes() {
        let buf1: [u8; 32] = SecureRandom::bytes();
        let buf2: [u8; 32] = SecureRandom::bytes();

        assert!(!buf1.iter().all(|&b| b == 0));
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_salts_are_fresh() {
        let a = SecureRandom::salt(16);
        let b = SecureRandom::salt(16);

        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
