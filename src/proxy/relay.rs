//! Bidirectional relays.
//!
//! A relay copies bytes both ways until one side finishes. The other
//! direction then gets a grace period to drain before both ends are closed.
//! An error on either side, or cancellation, tears down both at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::node::NodeTraffic;
use crate::tunnel::{TunnelReader, TunnelWriter, MAX_PAYLOAD};

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    /// Bytes read from the plain side and forwarded
    pub upload: u64,
    /// Bytes forwarded to the plain side
    pub download: u64,
    /// The tunnel side finished before the plain side; always false for
    /// direct relays
    pub tunnel_closed_first: bool,
}

/// Relay between two plain TCP sockets.
pub async fn relay_direct(
    mut client: TcpStream,
    mut target: TcpStream,
    cancel: &CancellationToken,
) -> Result<RelayTotals> {
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Direct relay cancelled");
            Ok(RelayTotals::default())
        }
        copied = tokio::io::copy_bidirectional(&mut client, &mut target) => {
            let (upload, download) = copied?;
            Ok(RelayTotals { upload, download, tunnel_closed_first: false })
        }
    }
}

/// Relay between a plain socket and a tunnel.
///
/// `upload` counts plain → tunnel bytes, `download` tunnel → plain. Byte
/// counts reflect what was forwarded even when the relay ends in an error.
/// When `traffic` is given, the node's counters grow as bytes move rather
/// than when the relay ends.
pub async fn relay_tunnel<R, W>(
    plain: TcpStream,
    mut tunnel_reader: TunnelReader<R>,
    mut tunnel_writer: TunnelWriter<W>,
    traffic: Option<&NodeTraffic>,
    close_grace: Duration,
    cancel: &CancellationToken,
) -> (RelayTotals, Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut plain_reader, mut plain_writer) = plain.into_split();
    let uploaded = AtomicU64::new(0);
    let downloaded = AtomicU64::new(0);

    let upload = async {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let n = plain_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tunnel_writer.send(&buf[..n]).await?;
            uploaded.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(traffic) = traffic {
                traffic.add_upload(n as u64);
            }
        }
        tunnel_writer.shutdown().await
    };

    let download = async {
        while let Some(data) = tunnel_reader.recv().await? {
            plain_writer.write_all(&data).await?;
            downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
            if let Some(traffic) = traffic {
                traffic.add_download(data.len() as u64);
            }
        }
        plain_writer.shutdown().await?;
        Ok::<(), Error>(())
    };

    tokio::pin!(upload);
    tokio::pin!(download);

    let mut tunnel_closed_first = false;
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Tunnel relay cancelled");
            Ok(())
        }
        r = &mut upload => match r {
            Ok(()) => drain(&mut download, close_grace, cancel).await,
            Err(e) => Err(e),
        },
        r = &mut download => {
            tunnel_closed_first = true;
            match r {
                Ok(()) => drain(&mut upload, close_grace, cancel).await,
                Err(e) => Err(e),
            }
        }
    };

    let totals = RelayTotals {
        upload: uploaded.load(Ordering::Relaxed),
        download: downloaded.load(Ordering::Relaxed),
        tunnel_closed_first,
    };
    (totals, result)
}

/// Let the remaining direction finish within `grace`.
async fn drain<F>(rest: F, grace: Duration, cancel: &CancellationToken) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        finished = timeout(grace, rest) => match finished {
            Ok(r) => r,
            Err(_) => {
                tracing::debug!("Relay grace period elapsed, closing");
                Ok(())
            }
        },
    }
}
