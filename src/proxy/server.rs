//! Local proxy server.
//!
//! Accepts SOCKS5 and HTTP proxy clients on one port, routes each
//! destination through the rule set and relays either directly or through
//! the fastest tunnel node. A failed tunnel open is retried once on another
//! node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::node::{Node, NodeSet, Registry};
use crate::proxy::inbound::{self, InboundRequest, Reply};
use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::relay::{relay_direct, relay_tunnel, RelayTotals};
use crate::rules::{Action, RuleSet};
use crate::selector::{select, Constraint};
use crate::tunnel::{Address, TunnelClient, TunnelStream};

/// What to do with PROXY traffic when no node is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Connect directly instead
    #[default]
    Direct,
    /// Refuse the connection
    Reject,
}

/// Routing and timing settings of the proxy server.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Constraint applied to every node selection
    pub constraint: Constraint,
    /// Behaviour when the first selection finds no node
    pub fallback: FallbackPolicy,
    /// Deadline for reading the client's request
    pub handshake_timeout: Duration,
    /// Deadline for DIRECT connects
    pub connect_timeout: Duration,
    /// Drain period after one relay direction closes
    pub close_grace: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            constraint: Constraint::default(),
            fallback: FallbackPolicy::Direct,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Accepted,
    DestinationParsed,
    Routed(Action),
    Relaying,
    Closed,
}

/// Per-connection bookkeeping, owned by the connection's task.
struct Session {
    peer: SocketAddr,
    state: ConnectionState,
    target: Option<Address>,
    node: Option<Arc<Node>>,
    totals: RelayTotals,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnectionState::Accepted,
            target: None,
            node: None,
            totals: RelayTotals::default(),
        }
    }

    fn advance(&mut self, state: ConnectionState) {
        tracing::trace!("{}: {:?} -> {:?}", self.peer, self.state, state);
        self.state = state;
    }
}

/// Local SOCKS5 / HTTP proxy.
pub struct ProxyServer {
    registry: Arc<Registry>,
    rules: RwLock<Arc<RuleSet>>,
    tunnel: TunnelClient,
    resolver: Resolver,
    settings: ProxySettings,
    metrics: ProxyMetrics,
}

impl ProxyServer {
    /// Create a proxy server over a shared registry.
    pub fn new(
        registry: Arc<Registry>,
        rules: RuleSet,
        tunnel: TunnelClient,
        resolver: Resolver,
        settings: ProxySettings,
    ) -> Self {
        Self {
            registry,
            rules: RwLock::new(Arc::new(rules)),
            tunnel,
            resolver,
            settings,
            metrics: ProxyMetrics::new(),
        }
    }

    /// Create a proxy server from a loaded configuration.
    pub fn from_config(config: &Config, registry: Arc<Registry>) -> Result<Self> {
        Ok(Self::new(
            registry,
            config.rules.clone(),
            TunnelClient::new(config.tunnel),
            Resolver::new(&config.dns)?,
            config.proxy.clone(),
        ))
    }

    /// Aggregate metrics.
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Registry used for node selection.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Swap in new nodes and rules.
    ///
    /// Connections already relaying keep the node and rules they started
    /// with. Nothing changes if the new node list is invalid.
    pub fn reload(&self, config: &Config) -> Result<()> {
        self.registry.reload(&config.nodes)?;
        *self.rules.write() = Arc::new(config.rules.clone());
        tracing::info!("Proxy reloaded with {} rules", config.rules.len());
        Ok(())
    }

    fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read())
    }

    /// Serve clients from `listener` until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Proxy listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Proxy shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    let cancel = cancel.clone();

                    tokio::spawn(async move {
                        server.metrics.increment_connections();
                        if let Err(e) = server.handle_connection(stream, peer_addr, &cancel).await {
                            tracing::debug!("Connection error from {}: {}", peer_addr, e);
                        }
                        server.metrics.decrement_connections();
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()> {
        client.set_nodelay(true)?;
        let mut session = Session::new(peer_addr);

        let request = timeout(self.settings.handshake_timeout, inbound::accept(&mut client))
            .await
            .map_err(|_| Error::Timeout(self.settings.handshake_timeout.as_millis() as u64))??;
        session.target = Some(request.target.clone());
        session.advance(ConnectionState::DestinationParsed);

        let action = self.rules().match_host(&request.target.host());
        tracing::debug!("{} -> {} [{}]", peer_addr, request.target, action);

        let result = match action {
            Action::Reject => self.refuse(&mut session, client, &request).await,
            Action::Direct => self.route_direct(&mut session, client, &request, cancel).await,
            Action::Proxy => self.route_proxy(&mut session, client, &request, cancel).await,
        };

        session.advance(ConnectionState::Closed);
        if let Some(target) = &session.target {
            tracing::debug!(
                "{} -> {} closed via {} ({} bytes up, {} bytes down)",
                peer_addr,
                target,
                session.node.as_ref().map_or("DIRECT", |n| n.name()),
                session.totals.upload,
                session.totals.download
            );
        }
        self.metrics
            .add_bytes(session.totals.upload, session.totals.download);
        result
    }

    async fn refuse(
        &self,
        session: &mut Session,
        mut client: TcpStream,
        request: &InboundRequest,
    ) -> Result<()> {
        session.advance(ConnectionState::Routed(Action::Reject));
        self.metrics.record_route(Action::Reject);
        request.reply(&mut client, Reply::Refused).await
    }

    async fn route_direct(
        &self,
        session: &mut Session,
        mut client: TcpStream,
        request: &InboundRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        session.advance(ConnectionState::Routed(Action::Direct));

        let mut target = match self
            .resolver
            .connect(&request.target, self.settings.connect_timeout)
            .await
        {
            Ok(target) => target,
            Err(e) => {
                self.metrics.increment_failures();
                let _ = request.reply(&mut client, Reply::Failure).await;
                return Err(e);
            }
        };
        self.metrics.record_route(Action::Direct);

        request.reply(&mut client, Reply::Success).await?;
        if !request.initial.is_empty() {
            target.write_all(&request.initial).await?;
        }

        session.advance(ConnectionState::Relaying);
        let totals = relay_direct(client, target, cancel).await?;
        session.totals = RelayTotals {
            upload: totals.upload + request.initial.len() as u64,
            ..totals
        };
        Ok(())
    }

    async fn route_proxy(
        &self,
        session: &mut Session,
        mut client: TcpStream,
        request: &InboundRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let nodes = self.registry.snapshot();

        let first = match select(&nodes, Some(&self.settings.constraint)) {
            Ok(node) => node,
            Err(Error::NoAvailableNode) => {
                tracing::warn!(
                    "No node available for {}, falling back to {:?}",
                    request.target,
                    self.settings.fallback
                );
                return match self.settings.fallback {
                    FallbackPolicy::Direct => {
                        self.route_direct(session, client, request, cancel).await
                    }
                    FallbackPolicy::Reject => self.refuse(session, client, request).await,
                };
            }
            Err(e) => return Err(e),
        };
        session.advance(ConnectionState::Routed(Action::Proxy));

        let (node, mut tunnel) = match self.open_with_failover(&nodes, first, &request.target).await
        {
            Ok(opened) => opened,
            Err(e) => {
                self.metrics.increment_failures();
                let _ = request.reply(&mut client, Reply::Failure).await;
                return Err(e);
            }
        };
        self.metrics.record_route(Action::Proxy);
        session.node = Some(Arc::clone(&node));

        request.reply(&mut client, Reply::Success).await?;
        if !request.initial.is_empty() {
            tunnel.send(&request.initial).await?;
            node.traffic().add_upload(request.initial.len() as u64);
        }

        session.advance(ConnectionState::Relaying);
        let (reader, writer) = tunnel.into_split();
        let (totals, result) = relay_tunnel(
            client,
            reader,
            writer,
            Some(node.traffic()),
            self.settings.close_grace,
            cancel,
        )
        .await;
        session.totals = RelayTotals {
            upload: totals.upload + request.initial.len() as u64,
            ..totals
        };

        if node_dropped_session(&session.totals, &result) {
            let failures = node.record_relay_failure();
            match &result {
                Err(e) => tracing::warn!(
                    "Relay via {} failed ({}), {} consecutive failures",
                    node.name(),
                    e,
                    failures
                ),
                Ok(()) => tracing::warn!(
                    "Node {} closed the session without answering, {} consecutive failures",
                    node.name(),
                    failures
                ),
            }
        }
        result
    }

    /// Open a tunnel via `first`, retrying once on the next best node.
    async fn open_with_failover(
        &self,
        nodes: &NodeSet,
        first: Arc<Node>,
        target: &Address,
    ) -> Result<(Arc<Node>, TunnelStream)> {
        let err = match self.tunnel.open(&first, target).await {
            Ok(tunnel) => return Ok((first, tunnel)),
            Err(e) if e.triggers_failover() => e,
            Err(e) => return Err(e),
        };

        let failures = first.record_relay_failure();
        self.metrics.increment_failovers();
        tracing::warn!(
            "Tunnel via {} failed ({}), {} consecutive failures; retrying",
            first.name(),
            err,
            failures
        );

        let constraint = self.settings.constraint.clone().excluding(first.name());
        let second = select(nodes, Some(&constraint))?;

        match self.tunnel.open(&second, target).await {
            Ok(tunnel) => Ok((second, tunnel)),
            Err(e) => {
                if e.triggers_failover() {
                    second.record_relay_failure();
                }
                tracing::warn!("Tunnel via {} failed ({}), giving up", second.name(), e);
                Err(e)
            }
        }
    }
}

/// Whether a finished tunnel relay counts against its node.
///
/// Either the session failed authentication, or the node ended it (cleanly
/// or by reset) after data was sent and before a single byte came back.
fn node_dropped_session(totals: &RelayTotals, result: &Result<()>) -> bool {
    let silent_close = totals.tunnel_closed_first && totals.download == 0 && totals.upload > 0;
    match result {
        Err(e) if e.is_auth_failure() => true,
        Ok(()) | Err(Error::Network(_)) => silent_close,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, MasterKey};
    use crate::node::NodeDescriptor;
    use crate::selector::DEFAULT_MAX_FAILURES;
    use crate::tunnel::{TunnelReader, TunnelServer, TunnelServerConfig, TunnelWriter};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    const PASSWORD: &str = "node-secret";

    /// Simulated node: reports the requested destination and answers every
    /// chunk upper-cased.
    async fn fake_node(cipher: CipherKind) -> (SocketAddr, mpsc::UnboundedReceiver<Address>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let key = MasterKey::from_password(PASSWORD, cipher);

        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let tx = tx.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let (r, w) = sock.into_split();
                    let mut reader = TunnelReader::new(r, cipher, key.clone());
                    let mut writer = TunnelWriter::new(w, cipher, &key).unwrap();

                    let header = reader.recv().await.unwrap().unwrap();
                    let (target, used) = Address::decode(&header).unwrap();
                    tx.send(target).unwrap();
                    if used < header.len() {
                        writer.send(&header[used..].to_ascii_uppercase()).await.unwrap();
                    }
                    while let Ok(Some(data)) = reader.recv().await {
                        writer.send(&data.to_ascii_uppercase()).await.unwrap();
                    }
                    let _ = writer.shutdown().await;
                });
            }
        });
        (addr, rx)
    }

    /// Node that accepts a session, swallows one chunk and hangs up.
    async fn hang_up_node(cipher: CipherKind) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = MasterKey::from_password(PASSWORD, cipher);

        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let key = key.clone();
                tokio::spawn(async move {
                    let (r, _w) = sock.into_split();
                    let mut reader = TunnelReader::new(r, cipher, key);
                    let _header = reader.recv().await;
                    let _data = reader.recv().await;
                });
            }
        });
        addr
    }

    /// Real tunnel endpoint; stops when the token is dropped.
    async fn tunnel_endpoint(
        cipher: CipherKind,
        password: &str,
    ) -> (SocketAddr, tokio_util::sync::DropGuard) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TunnelServer::new(TunnelServerConfig::new(addr.to_string(), cipher, password));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { server.serve(listener, token).await });
        (addr, cancel.drop_guard())
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn descriptor(name: &str, addr: SocketAddr, cipher: CipherKind) -> NodeDescriptor {
        descriptor_with_password(name, addr, cipher, PASSWORD)
    }

    fn descriptor_with_password(
        name: &str,
        addr: SocketAddr,
        cipher: CipherKind,
        password: &str,
    ) -> NodeDescriptor {
        NodeDescriptor::new(name, addr.ip().to_string(), addr.port(), cipher.as_str(), password)
    }

    struct Harness {
        addr: SocketAddr,
        server: Arc<ProxyServer>,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    /// Start a proxy; `latencies` marks nodes reachable in order, `None` leaves
    /// a node unprobed.
    async fn start_proxy(
        nodes: Vec<NodeDescriptor>,
        latencies: &[Option<u64>],
        rules: &[&str],
        settings: ProxySettings,
    ) -> Harness {
        let registry = Arc::new(Registry::new(&nodes).unwrap());
        for (node, latency) in registry.snapshot().iter().zip(latencies) {
            if let Some(ms) = latency {
                node.record_success(Duration::from_millis(*ms));
            }
        }

        let server = Arc::new(ProxyServer::new(
            registry,
            RuleSet::parse(rules).unwrap(),
            TunnelClient::default(),
            Resolver::system(),
            settings,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));

        Harness {
            addr,
            server,
            cancel,
        }
    }

    /// SOCKS5 handshake for `target`; returns the stream and the reply code.
    async fn socks_connect(proxy: SocketAddr, target: &Address) -> (TcpStream, u8) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&target.to_bytes().unwrap());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        (stream, reply[1])
    }

    async fn http_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_socks5_connect_through_fastest_node() {
        let cipher = CipherKind::ChaCha20Poly1305;
        let (slow_addr, mut slow_seen) = fake_node(cipher).await;
        let (fast_addr, mut fast_seen) = fake_node(cipher).await;
        let proxy = start_proxy(
            vec![
                descriptor("hk-01", slow_addr, cipher),
                descriptor("hk-02", fast_addr, cipher),
            ],
            &[Some(80), Some(20)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let target = Address::Domain("example.com".into(), 443);
        let (mut stream, code) = socks_connect(proxy.addr, &target).await;
        assert_eq!(code, 0x00);

        stream.write_all(b"client hello").await.unwrap();
        let mut reply = [0u8; 12];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"CLIENT HELLO");
        assert_eq!(fast_seen.recv().await.unwrap(), target);
        assert!(slow_seen.try_recv().is_err());

        drop(stream);
        wait_for(|| proxy.server.metrics().snapshot().bytes_up == 12).await;

        let registry = proxy.server.registry();
        let fast = registry.get("hk-02").unwrap();
        assert_eq!(fast.traffic().upload(), 12);
        assert_eq!(fast.traffic().download(), 12);
        assert_eq!(registry.get("hk-01").unwrap().traffic().upload(), 0);
        assert_eq!(proxy.server.metrics().snapshot().proxied_connections, 1);
    }

    #[tokio::test]
    async fn test_node_traffic_grows_during_relay() {
        let cipher = CipherKind::Aes128Gcm;
        let (node_addr, _seen) = fake_node(cipher).await;
        let proxy = start_proxy(
            vec![descriptor("long-lived", node_addr, cipher)],
            &[Some(10)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let (mut stream, code) =
            socks_connect(proxy.addr, &Address::Domain("example.com".into(), 443)).await;
        assert_eq!(code, 0x00);
        stream.write_all(b"abcde").await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();

        let node = proxy.server.registry().get("long-lived").unwrap();
        wait_for(|| node.traffic().upload() == 5 && node.traffic().download() == 5).await;
        // The session is still open, so session totals have not been added yet
        assert_eq!(proxy.server.metrics().snapshot().bytes_up, 0);
        drop(stream);
    }

    #[tokio::test]
    async fn test_rejecting_node_fails_over_and_is_penalized() {
        let target = echo_target().await;
        let cipher = CipherKind::Aes256Gcm;
        let (endpoint, _endpoint_guard) = tunnel_endpoint(cipher, "right").await;
        let proxy = start_proxy(
            vec![
                descriptor_with_password("bad", endpoint, cipher, "wrong"),
                descriptor_with_password("good", endpoint, cipher, "right"),
            ],
            &[Some(5), Some(50)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        // Once "bad" reaches the failure threshold it is no longer selected
        for _ in 0..=DEFAULT_MAX_FAILURES {
            let (mut stream, code) = socks_connect(proxy.addr, &Address::Socket(target)).await;
            assert_eq!(code, 0x00);
            stream.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ping");
        }

        let registry = proxy.server.registry();
        assert_eq!(
            registry.get("bad").unwrap().health().consecutive_failures,
            DEFAULT_MAX_FAILURES
        );
        assert_eq!(registry.get("good").unwrap().health().consecutive_failures, 0);
        assert_eq!(
            proxy.server.metrics().snapshot().failovers,
            DEFAULT_MAX_FAILURES as u64
        );
    }

    #[tokio::test]
    async fn test_node_hanging_up_unanswered_counts_as_failure() {
        let cipher = CipherKind::ChaCha20Poly1305;
        let node_addr = hang_up_node(cipher).await;
        let proxy = start_proxy(
            vec![descriptor("flaky", node_addr, cipher)],
            &[Some(10)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let (mut stream, code) =
            socks_connect(proxy.addr, &Address::Domain("example.com".into(), 443)).await;
        assert_eq!(code, 0x00);
        stream.write_all(b"ping").await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        drop(stream);

        let node = proxy.server.registry().get("flaky").unwrap();
        wait_for(|| node.health().consecutive_failures == 1).await;
    }

    #[test]
    fn test_node_dropped_session_classification() {
        let silent = RelayTotals {
            upload: 4,
            download: 0,
            tunnel_closed_first: true,
        };
        let answered = RelayTotals {
            download: 10,
            ..silent
        };
        let client_left = RelayTotals {
            tunnel_closed_first: false,
            ..silent
        };
        let reset = || -> Result<()> {
            Err(Error::Network(std::io::ErrorKind::ConnectionReset.into()))
        };

        assert!(node_dropped_session(&silent, &Ok(())));
        assert!(node_dropped_session(&silent, &reset()));
        assert!(node_dropped_session(&answered, &Err(Error::FrameAuthentication(2))));
        assert!(!node_dropped_session(&answered, &Ok(())));
        assert!(!node_dropped_session(&client_left, &Ok(())));
        assert!(!node_dropped_session(&silent, &Err(Error::protocol("bad chunk"))));
    }

    #[tokio::test]
    async fn test_http_connect_through_node() {
        let cipher = CipherKind::Aes256Gcm;
        let (node_addr, mut seen) = fake_node(cipher).await;
        let proxy = start_proxy(
            vec![descriptor("jp-01", node_addr, cipher)],
            &[Some(30)],
            &["DOMAIN-SUFFIX,example.com,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(b"CONNECT www.example.com:443 HTTP/1.1\r\nHost: www.example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(http_head(&mut stream).await.starts_with("HTTP/1.1 200"));

        stream.write_all(b"abc").await.unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ABC");
        assert_eq!(
            seen.recv().await.unwrap(),
            Address::Domain("www.example.com".into(), 443)
        );
    }

    #[tokio::test]
    async fn test_http_forward_sends_rewritten_request() {
        let cipher = CipherKind::Aes128Gcm;
        let (node_addr, _seen) = fake_node(cipher).await;
        let proxy = start_proxy(
            vec![descriptor("node", node_addr, cipher)],
            &[Some(10)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(b"GET http://example.com/a HTTP/1.1\r\nProxy-Connection: close\r\n\r\n")
            .await
            .unwrap();

        // The fake node upper-cases what it receives
        let expected = b"GET /A HTTP/1.1\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_failover_to_second_node() {
        let cipher = CipherKind::Aes256Gcm;
        let dead = closed_port().await;
        let (alive, mut seen) = fake_node(cipher).await;
        let proxy = start_proxy(
            vec![descriptor("dead", dead, cipher), descriptor("alive", alive, cipher)],
            &[Some(5), Some(50)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let target = Address::Domain("example.com".into(), 443);
        let (mut stream, code) = socks_connect(proxy.addr, &target).await;
        assert_eq!(code, 0x00);

        stream.write_all(b"x").await.unwrap();
        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"X");
        assert_eq!(seen.recv().await.unwrap(), target);

        let registry = proxy.server.registry();
        assert_eq!(registry.get("dead").unwrap().health().consecutive_failures, 1);
        assert_eq!(registry.get("alive").unwrap().health().consecutive_failures, 0);
        assert_eq!(proxy.server.metrics().snapshot().failovers, 1);
    }

    #[tokio::test]
    async fn test_both_nodes_failing_reports_failure() {
        let cipher = CipherKind::Aes128Gcm;
        let proxy = start_proxy(
            vec![
                descriptor("a", closed_port().await, cipher),
                descriptor("b", closed_port().await, cipher),
            ],
            &[Some(5), Some(6)],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;

        let (_stream, code) =
            socks_connect(proxy.addr, &Address::Domain("example.com".into(), 443)).await;
        assert_eq!(code, 0x05);

        let registry = proxy.server.registry();
        wait_for(|| registry.get("b").unwrap().health().consecutive_failures == 1).await;
        assert_eq!(registry.get("a").unwrap().health().consecutive_failures, 1);
        assert_eq!(proxy.server.metrics().snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_reject_rule_refuses() {
        let proxy = start_proxy(
            vec![],
            &[],
            &["DOMAIN-SUFFIX,ads.example,REJECT"],
            ProxySettings::default(),
        )
        .await;

        let (_stream, code) =
            socks_connect(proxy.addr, &Address::Domain("tracker.ads.example".into(), 80)).await;
        assert_eq!(code, 0x02);

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(b"CONNECT ads.example:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(http_head(&mut stream).await.starts_with("HTTP/1.1 403"));
        assert_eq!(proxy.server.metrics().snapshot().rejected_connections, 2);
    }

    #[tokio::test]
    async fn test_direct_route() {
        let target = echo_target().await;
        let proxy = start_proxy(vec![], &[], &[], ProxySettings::default()).await;

        let (mut stream, code) = socks_connect(proxy.addr, &Address::Socket(target)).await;
        assert_eq!(code, 0x00);
        stream.write_all(b"direct").await.unwrap();
        let mut reply = [0u8; 6];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"direct");
        assert_eq!(proxy.server.metrics().snapshot().direct_connections, 1);
    }

    #[tokio::test]
    async fn test_fallback_policy() {
        let target = echo_target().await;
        let cipher = CipherKind::Aes128Gcm;
        let unprobed = vec![descriptor("idle", closed_port().await, cipher)];

        let direct = start_proxy(
            unprobed.clone(),
            &[None],
            &["MATCH,Proxy"],
            ProxySettings::default(),
        )
        .await;
        let (mut stream, code) = socks_connect(direct.addr, &Address::Socket(target)).await;
        assert_eq!(code, 0x00);
        stream.write_all(b"ok").await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");

        let settings = ProxySettings {
            fallback: FallbackPolicy::Reject,
            ..ProxySettings::default()
        };
        let reject = start_proxy(unprobed, &[None], &["MATCH,Proxy"], settings).await;
        let (_stream, code) = socks_connect(reject.addr, &Address::Socket(target)).await;
        assert_eq!(code, 0x02);
    }

    #[tokio::test]
    async fn test_malformed_request_is_closed() {
        let proxy = start_proxy(vec![], &[], &[], ProxySettings::default()).await;
        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream.write_all(b"\x16\x03\x01garbage").await.unwrap();

        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        assert_eq!(proxy.server.metrics().snapshot().direct_connections, 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_rules_and_nodes() {
        let proxy = start_proxy(vec![], &[], &[], ProxySettings::default()).await;
        assert!(proxy.server.registry().is_empty());

        let config = Config {
            nodes: vec![descriptor("new", closed_port().await, CipherKind::Aes128Gcm)],
            rules: RuleSet::parse(&["DOMAIN,blocked.test,REJECT"]).unwrap(),
            ..Config::default()
        };
        proxy.server.reload(&config).unwrap();
        assert_eq!(proxy.server.registry().len(), 1);

        let (_stream, code) =
            socks_connect(proxy.addr, &Address::Domain("blocked.test".into(), 80)).await;
        assert_eq!(code, 0x02);
    }
}
