//! Encrypted tunnel stream halves.
//!
//! Both directions start with the sender's salt in the clear, followed by
//! AEAD chunks sealed with the subkey derived from that salt. The writer
//! emits its salt with the first chunk; the reader consumes the peer's salt
//! before the first chunk it opens. The same halves serve the local client
//! and the node-side endpoint.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::crypto::{Aead, CipherKind, MasterKey, SecureRandom, SessionKey};
use crate::error::{Error, Result};
use crate::tunnel::frame::{FrameDecoder, FrameEncoder, MAX_PAYLOAD};

/// Read buffer growth step
const READ_CHUNK: usize = MAX_PAYLOAD + 64;

/// Lifecycle of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No transport yet
    Unconnected,
    /// Transport up, salt and address being exchanged
    Handshaking,
    /// Carrying payload
    Established,
    /// Either side closed or failed
    Closed,
}

/// Receiving half of a tunnel.
pub struct TunnelReader<R> {
    inner: R,
    cipher: CipherKind,
    key: MasterKey,
    decoder: Option<FrameDecoder>,
    buf: BytesMut,
    pending: Option<Vec<u8>>,
}

impl<R: AsyncRead + Unpin> TunnelReader<R> {
    /// Wrap a read half.
    pub fn new(inner: R, cipher: CipherKind, key: MasterKey) -> Self {
        Self {
            inner,
            cipher,
            key,
            decoder: None,
            buf: BytesMut::with_capacity(READ_CHUNK),
            pending: None,
        }
    }

    /// Receive the next decrypted chunk.
    ///
    /// Returns `Ok(None)` on a clean EOF at a chunk boundary. EOF inside a
    /// chunk is a protocol error. Cancel-safe: partial input stays buffered.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.pending.take() {
            return Ok(Some(data));
        }

        loop {
            if let Some(data) = self.try_decode()? {
                return Ok(Some(data));
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() && !self.is_mid_frame() {
                    return Ok(None);
                }
                return Err(Error::protocol("tunnel closed inside a chunk"));
            }
        }
    }

    /// Put a chunk back so the next `recv` returns it.
    pub(crate) fn unread(&mut self, data: Vec<u8>) {
        self.pending = Some(data);
    }

    fn is_mid_frame(&self) -> bool {
        self.decoder.as_ref().map_or(false, FrameDecoder::is_mid_frame)
    }

    fn try_decode(&mut self) -> Result<Option<Vec<u8>>> {
        if self.decoder.is_none() {
            let salt_len = self.cipher.salt_len();
            if self.buf.len() < salt_len {
                return Ok(None);
            }
            let salt = self.buf.split_to(salt_len);
            let subkey = SessionKey::derive(&self.key, &salt)?;
            self.decoder = Some(FrameDecoder::new(Aead::new(self.cipher, &subkey)?));
        }

        match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(&mut self.buf),
            None => Ok(None),
        }
    }
}

/// Sending half of a tunnel.
pub struct TunnelWriter<W> {
    inner: W,
    encoder: FrameEncoder,
    salt: Option<Vec<u8>>,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> TunnelWriter<W> {
    /// Wrap a write half with a fresh random salt.
    pub fn new(inner: W, cipher: CipherKind, key: &MasterKey) -> Result<Self> {
        let salt = SecureRandom::salt(cipher.salt_len());
        Self::with_salt(inner, cipher, key, salt)
    }

    /// Wrap a write half with a given salt.
    pub fn with_salt(inner: W, cipher: CipherKind, key: &MasterKey, salt: Vec<u8>) -> Result<Self> {
        if salt.len() != cipher.salt_len() {
            return Err(Error::Buffer {
                expected: cipher.salt_len(),
                actual: salt.len(),
            });
        }
        let subkey = SessionKey::derive(key, &salt)?;
        Ok(Self {
            inner,
            encoder: FrameEncoder::new(Aead::new(cipher, &subkey)?),
            salt: Some(salt),
            buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    /// Seal and write `data`, prefixed by the salt on the first call.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.buf.clear();
        if let Some(salt) = self.salt.take() {
            self.buf.extend_from_slice(&salt);
        }
        self.encoder.encode(data, &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        Ok(())
    }

    /// Flush and half-close the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Frame sequence of the next seal.
    pub fn sequence(&self) -> u64 {
        self.encoder.sequence()
    }
}

/// An established tunnel session over TCP.
pub struct TunnelStream {
    reader: TunnelReader<OwnedReadHalf>,
    writer: TunnelWriter<OwnedWriteHalf>,
    state: TunnelState,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("state", &self.state)
            .field("sent", &self.writer.sequence())
            .finish()
    }
}

impl TunnelStream {
    /// Wrap a connected socket, generating a fresh outgoing salt.
    pub fn new(stream: TcpStream, cipher: CipherKind, key: &MasterKey) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: TunnelReader::new(read_half, cipher, key.clone()),
            writer: TunnelWriter::new(write_half, cipher, key)?,
            state: TunnelState::Handshaking,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TunnelState) {
        tracing::trace!("Tunnel state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Send payload through the tunnel.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let result = self.writer.send(data).await;
        if result.is_err() {
            self.state = TunnelState::Closed;
        }
        result
    }

    /// Receive payload; `None` once the node closed the session.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let result = self.reader.recv().await;
        if !matches!(result, Ok(Some(_))) {
            self.state = TunnelState::Closed;
        }
        result
    }

    pub(crate) fn reader_mut(&mut self) -> &mut TunnelReader<OwnedReadHalf> {
        &mut self.reader
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (TunnelReader<OwnedReadHalf>, TunnelWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_halves_over_duplex() {
        let cipher = CipherKind::Aes256Gcm;
        let key = MasterKey::from_password("duplex", cipher);
        let (a, b) = duplex(64 * 1024);

        let mut writer = TunnelWriter::new(a, cipher, &key).unwrap();
        let mut reader = TunnelReader::new(b, cipher, key.clone());

        writer.send(b"one").await.unwrap();
        writer.send(&vec![0xAB; 20_000]).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap(), b"one");

        let mut big = Vec::new();
        while let Some(chunk) = reader.recv().await.unwrap() {
            big.extend_from_slice(&chunk);
        }
        assert_eq!(big, vec![0xAB; 20_000]);
    }

    #[tokio::test]
    async fn test_salt_sent_once() {
        let cipher = CipherKind::ChaCha20Poly1305;
        let key = MasterKey::from_password("salt", cipher);
        let (a, mut b) = duplex(4096);

        let salt = vec![9u8; 32];
        let mut writer = TunnelWriter::with_salt(a, cipher, &key, salt.clone()).unwrap();
        writer.send(b"x").await.unwrap();
        writer.send(b"y").await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..32], salt.as_slice());
        // salt + 2 * (length block + 1 byte + tag)
        assert_eq!(wire.len(), 32 + 2 * (18 + 1 + 16));
    }

    #[tokio::test]
    async fn test_truncated_chunk_is_error() {
        let cipher = CipherKind::Aes128Gcm;
        let key = MasterKey::from_password("trunc", cipher);
        let (a, b) = duplex(4096);

        let mut sink = Vec::new();
        let mut writer = TunnelWriter::new(&mut sink, cipher, &key).unwrap();
        writer.send(b"truncated payload").await.unwrap();
        drop(writer);

        let mut raw = a;
        raw.write_all(&sink[..sink.len() - 4]).await.unwrap();
        drop(raw);

        let mut reader = TunnelReader::new(b, cipher, key);
        assert!(matches!(reader.recv().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_wrong_password_fails_authentication() {
        let cipher = CipherKind::Aes256Gcm;
        let (a, b) = duplex(4096);

        let mut writer =
            TunnelWriter::new(a, cipher, &MasterKey::from_password("right", cipher)).unwrap();
        writer.send(b"hello").await.unwrap();

        let mut reader = TunnelReader::new(b, cipher, MasterKey::from_password("wrong", cipher));
        let err = reader.recv().await.unwrap_err();
        assert!(err.is_auth_failure());
    }
}
