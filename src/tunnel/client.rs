//! Tunnel client: opens encrypted sessions to nodes.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::tunnel::address::Address;
use crate::tunnel::stream::{TunnelState, TunnelStream};

/// Default window for a node to reject a new session
///
/// A node that cannot decrypt the address chunk drops the connection at
/// once; one that accepted it stays silent until the destination answers.
pub const DEFAULT_AUTH_GRACE: Duration = Duration::from_millis(300);

/// Timeouts used when opening a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Deadline for sending salt and address
    pub handshake_timeout: Duration,
    /// How long to watch for the node rejecting the session; zero disables
    pub auth_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            auth_grace: DEFAULT_AUTH_GRACE,
        }
    }
}

/// Opens tunnel sessions.
#[derive(Debug, Clone, Default)]
pub struct TunnelClient {
    config: TunnelConfig,
}

impl TunnelClient {
    /// Create a client with the given timeouts.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Timeouts in use.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Open a session through `node` to `target`.
    ///
    /// Transport failures and deadline overruns are [`Error::Handshake`].
    /// A node that closes, resets or sends an undecryptable first response
    /// within the grace window yields [`Error::Authentication`].
    pub async fn open(&self, node: &Node, target: &Address) -> Result<TunnelStream> {
        let endpoint = node.endpoint();
        tracing::trace!("Tunnel {:?} to {} via {}", TunnelState::Unconnected, target, endpoint);

        let connect_timeout = self.config.connect_timeout;
        let stream = timeout(connect_timeout, TcpStream::connect((node.server(), node.port())))
            .await
            .map_err(|_| {
                Error::handshake(format!(
                    "connect to {} timed out after {}ms",
                    endpoint,
                    connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::handshake(format!("connect to {}: {}", endpoint, e)))?;

        stream.set_nodelay(true)?;

        let mut tunnel = TunnelStream::new(stream, node.cipher(), node.key())?;
        let header = target.to_bytes()?;

        let handshake_timeout = self.config.handshake_timeout;
        timeout(handshake_timeout, tunnel.send(&header))
            .await
            .map_err(|_| {
                Error::handshake(format!(
                    "handshake with {} timed out after {}ms",
                    endpoint,
                    handshake_timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::handshake(format!("handshake with {}: {}", endpoint, e)))?;

        if !self.config.auth_grace.is_zero() {
            self.await_rejection(&mut tunnel).await?;
        }

        tunnel.set_state(TunnelState::Established);
        tracing::debug!("Tunnel to {} established via {}", target, node.name());
        Ok(tunnel)
    }

    /// Watch the session for the grace window. Silence means accepted.
    async fn await_rejection(&self, tunnel: &mut TunnelStream) -> Result<()> {
        match timeout(self.config.auth_grace, tunnel.reader_mut().recv()).await {
            Err(_) => Ok(()),
            Ok(Ok(Some(first))) => {
                tunnel.reader_mut().unread(first);
                Ok(())
            }
            Ok(Ok(None)) => Err(Error::Authentication),
            Ok(Err(e)) if e.is_auth_failure() => Err(Error::Authentication),
            Ok(Err(Error::Network(e)))
                if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) =>
            {
                Err(Error::Authentication)
            }
            Ok(Err(e)) => Err(Error::handshake(e.to_string())),
        }
    }
}
