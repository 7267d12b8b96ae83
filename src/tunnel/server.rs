//! Node-side tunnel endpoint.
//!
//! Accepts tunnel sessions, reads the destination from the first chunk,
//! connects to it and relays. Sessions that fail to authenticate are
//! dropped without a reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::crypto::{CipherKind, MasterKey};
use crate::error::{Error, Result};
use crate::proxy::relay::relay_tunnel;
use crate::tunnel::address::Address;
use crate::tunnel::stream::{TunnelReader, TunnelWriter};

/// Runtime configuration of a tunnel endpoint.
#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    /// Listen address, e.g. `0.0.0.0:8388`
    pub listen: String,
    /// Session cipher
    pub cipher: CipherKind,
    /// Master key derived from the password
    pub key: MasterKey,
    /// Deadline for receiving salt and address
    pub handshake_timeout: Duration,
    /// Deadline for connecting to the destination
    pub connect_timeout: Duration,
    /// Drain period after one direction closes
    pub close_grace: Duration,
}

impl TunnelServerConfig {
    /// Configuration with default timeouts.
    pub fn new(listen: impl Into<String>, cipher: CipherKind, password: &str) -> Self {
        Self {
            listen: listen.into(),
            cipher,
            key: MasterKey::from_password(password, cipher),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Tunnel endpoint serving many sessions.
pub struct TunnelServer {
    config: Arc<TunnelServerConfig>,
}

impl TunnelServer {
    /// Create an endpoint.
    pub fn new(config: TunnelServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        tracing::info!("Tunnel endpoint listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// Serve sessions from an already bound listener until cancelled.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Tunnel endpoint shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let config = Arc::clone(&self.config);
                    let cancel = cancel.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_session(config, stream, peer_addr, cancel).await
                        {
                            tracing::debug!("Session error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_session(
        config: Arc<TunnelServerConfig>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = TunnelReader::new(read_half, config.cipher, config.key.clone());
        let writer = TunnelWriter::new(write_half, config.cipher, &config.key)?;

        let header = timeout(config.handshake_timeout, reader.recv())
            .await
            .map_err(|_| Error::Timeout(config.handshake_timeout.as_millis() as u64))??
            .ok_or_else(|| Error::handshake("session closed before address"))?;

        let (target, used) = Address::decode(&header)?;
        tracing::debug!("Session from {} to {}", peer_addr, target);

        let mut outbound = timeout(
            config.connect_timeout,
            TcpStream::connect((target.host().as_str(), target.port())),
        )
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout.as_millis() as u64))??;
        outbound.set_nodelay(true)?;

        // Payload sent together with the address
        if used < header.len() {
            outbound.write_all(&header[used..]).await?;
        }

        let (totals, result) =
            relay_tunnel(outbound, reader, writer, None, config.close_grace, &cancel).await;
        tracing::debug!(
            "Session to {} closed ({} bytes out, {} bytes back)",
            target,
            totals.upload,
            totals.download
        );
        result
    }
}
