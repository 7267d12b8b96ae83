//! AEAD chunk framing.
//!
//! Each chunk on the wire is
//!
//! ```text
//! [encrypted length (2, BE) + tag][encrypted payload + tag]
//! ```
//!
//! with the payload capped at [`MAX_PAYLOAD`]. Every seal or open consumes
//! one nonce, so a chunk advances its direction's counter by two.

use bytes::{BufMut, BytesMut};

use crate::crypto::{Aead, Nonce, TAG_SIZE};
use crate::error::{Error, Result};

/// Largest payload carried by one chunk (16 KiB - 1)
pub const MAX_PAYLOAD: usize = 0x3FFF;

/// Encrypted length header size on the wire
pub const LENGTH_BLOCK: usize = 2 + TAG_SIZE;

/// Seals outgoing payloads into chunks.
pub struct FrameEncoder {
    aead: Aead,
    nonce: Nonce,
}

impl FrameEncoder {
    /// Create an encoder starting at nonce 0.
    pub fn new(aead: Aead) -> Self {
        Self {
            aead,
            nonce: Nonce::new(0),
        }
    }

    /// Seal `payload` into `dst`, splitting it into as many chunks as needed.
    ///
    /// An empty payload produces no output.
    pub fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        dst.reserve(payload.len() + (payload.len() / MAX_PAYLOAD + 1) * (LENGTH_BLOCK + TAG_SIZE));

        for chunk in payload.chunks(MAX_PAYLOAD) {
            let len = (chunk.len() as u16).to_be_bytes();
            let sealed_len = self.seal(&len)?;
            dst.put_slice(&sealed_len);

            let sealed = self.seal(chunk)?;
            dst.put_slice(&sealed);
        }
        Ok(())
    }

    /// Nonce counter of the next seal.
    pub fn sequence(&self) -> u64 {
        self.nonce.counter()
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.aead.encrypt(&self.nonce, plaintext, b"")?;
        self.nonce.increment();
        Ok(sealed)
    }
}

/// Opens incoming chunks from a byte buffer.
///
/// Partial chunks stay in the buffer until the rest arrives; no plaintext
/// is released before its tag has been verified.
pub struct FrameDecoder {
    aead: Aead,
    nonce: Nonce,
    pending_len: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder starting at nonce 0.
    pub fn new(aead: Aead) -> Self {
        Self {
            aead,
            nonce: Nonce::new(0),
            pending_len: None,
        }
    }

    /// Decode one chunk from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any authentication
    /// failure is reported as [`Error::FrameAuthentication`] and leaves the
    /// decoder unusable.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_BLOCK {
                    return Ok(None);
                }
                let block = src.split_to(LENGTH_BLOCK);
                let plain = self.open(&block)?;
                let len = (u16::from_be_bytes([plain[0], plain[1]]) as usize) & MAX_PAYLOAD;
                if len == 0 {
                    return Err(Error::protocol("zero-length chunk"));
                }
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len + TAG_SIZE {
            return Ok(None);
        }

        let block = src.split_to(len + TAG_SIZE);
        let payload = self.open(&block)?;
        self.pending_len = None;
        Ok(Some(payload))
    }

    /// Check if a chunk header has been consumed without its payload.
    pub fn is_mid_frame(&self) -> bool {
        self.pending_len.is_some()
    }

    /// Nonce counter of the next open.
    pub fn sequence(&self) -> u64 {
        self.nonce.counter()
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.nonce.counter();
        let plain = self
            .aead
            .decrypt(&self.nonce, sealed, b"")
            .map_err(|_| Error::FrameAuthentication(sequence))?;
        self.nonce.increment();
        Ok(plain)
    }
}
