//! Inbound proxy handshakes.
//!
//! One listener serves SOCKS5 and HTTP proxy clients; the first byte tells
//! them apart (`0x05` for SOCKS5, an ASCII letter for an HTTP method).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::tunnel::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// SOCKS protocol version
const SOCKS5_VERSION: u8 = 0x05;
/// SOCKS5 "no authentication" method
const METHOD_NO_AUTH: u8 = 0x00;
/// SOCKS5 "no acceptable methods"
const METHOD_NONE: u8 = 0xFF;
/// SOCKS5 CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 reply codes
const REP_SUCCEEDED: u8 = 0x00;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Largest HTTP request head accepted
const MAX_HTTP_HEAD: usize = 16 * 1024;

/// Headers meant for the proxy, never forwarded
const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// How the client reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundProtocol {
    /// SOCKS5 CONNECT
    Socks5,
    /// HTTP CONNECT tunnel
    HttpConnect,
    /// Plain HTTP request with an absolute URI
    HttpForward,
}

/// Outcome reported back to the client before relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Destination reached
    Success,
    /// Refused by a REJECT rule
    Refused,
    /// No route could be established
    Failure,
}

/// A parsed inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    /// Protocol spoken by the client
    pub protocol: InboundProtocol,
    /// Requested destination
    pub target: Address,
    /// Bytes to send to the destination before relaying (rewritten HTTP head
    /// plus anything read past it)
    pub initial: Vec<u8>,
}

impl InboundRequest {
    /// Send the protocol-specific reply for `reply`.
    ///
    /// A successful forward-mode HTTP request gets no reply of its own; the
    /// destination's response is relayed instead.
    pub async fn reply<W>(&self, writer: &mut W, reply: Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes: &[u8] = match (self.protocol, reply) {
            (InboundProtocol::Socks5, reply) => {
                let code = match reply {
                    Reply::Success => REP_SUCCEEDED,
                    Reply::Refused => REP_NOT_ALLOWED,
                    Reply::Failure => REP_REFUSED,
                };
                return write_socks_reply(writer, code).await;
            }
            (InboundProtocol::HttpConnect, Reply::Success) => {
                b"HTTP/1.1 200 Connection Established\r\n\r\n"
            }
            (InboundProtocol::HttpForward, Reply::Success) => return Ok(()),
            (_, Reply::Refused) => {
                b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            }
            (_, Reply::Failure) => {
                b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            }
        };
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Read and parse the client's request.
///
/// SOCKS5 method negotiation is answered here; the final reply is left to
/// the caller via [`InboundRequest::reply`].
pub async fn accept<S>(stream: &mut S) -> Result<InboundRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = stream.read_u8().await?;
    match first {
        SOCKS5_VERSION => accept_socks5(stream).await,
        b'A'..=b'Z' | b'a'..=b'z' => accept_http(stream, first).await,
        other => Err(Error::protocol(format!(
            "unrecognized proxy protocol (first byte 0x{:02x})",
            other
        ))),
    }
}

async fn accept_socks5<S>(stream: &mut S) -> Result<InboundRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version byte already consumed
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NONE]).await?;
        return Err(Error::protocol("SOCKS5 client offers no supported auth method"));
    }
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;

    if version != SOCKS5_VERSION {
        return Err(Error::protocol(format!("bad SOCKS version {}", version)));
    }
    if command != CMD_CONNECT {
        write_socks_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::protocol(format!("unsupported SOCKS5 command 0x{:02x}", command)));
    }
    if !matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
        write_socks_reply(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
        return Err(Error::protocol(format!("unsupported address type 0x{:02x}", atyp)));
    }

    let target = Address::read_from(stream, atyp).await?;
    Ok(InboundRequest {
        protocol: InboundProtocol::Socks5,
        target,
        initial: Vec::new(),
    })
}

async fn write_socks_reply<W>(writer: &mut W, code: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Bound address is not meaningful to clients; report 0.0.0.0:0
    writer
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    writer.flush().await?;
    Ok(())
}

async fn accept_http<S>(stream: &mut S, first: u8) -> Result<InboundRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![first];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HTTP_HEAD {
            return Err(Error::protocol("HTTP request head too large"));
        }
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed inside HTTP request head"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::protocol("HTTP request head is not UTF-8"))?;
    let rest = &buf[head_end + 4..];

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) if v.starts_with("HTTP/") => (m, u, v),
        _ => {
            return Err(Error::protocol(format!(
                "malformed HTTP request line: {:?}",
                request_line
            )))
        }
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(uri, None)?;
        return Ok(InboundRequest {
            protocol: InboundProtocol::HttpConnect,
            target: Address::from_host(&host, port),
            initial: rest.to_vec(),
        });
    }

    let (target, path) = parse_absolute_uri(uri)?;

    let mut rewritten = format!("{} {} {}\r\n", method, path, version);
    for line in lines {
        let name = line.split(':').next().unwrap_or_default().trim();
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    rewritten.push_str("\r\n");

    let mut initial = rewritten.into_bytes();
    initial.extend_from_slice(rest);

    Ok(InboundRequest {
        protocol: InboundProtocol::HttpForward,
        target,
        initial,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split `http://host[:port]/path?query` into destination and origin-form.
pub(crate) fn parse_absolute_uri(uri: &str) -> Result<(Address, String)> {
    let scheme_end = uri
        .find("://")
        .ok_or_else(|| Error::protocol(format!("proxy request needs an absolute URI: {}", uri)))?;
    if !uri[..scheme_end].eq_ignore_ascii_case("http") {
        return Err(Error::protocol(format!("unsupported URI scheme in {}", uri)));
    }

    let after_scheme = &uri[scheme_end + 3..];
    let split = after_scheme.find(['/', '?']).unwrap_or(after_scheme.len());
    let authority = &after_scheme[..split];
    let path = match &after_scheme[split..] {
        "" => "/".to_string(),
        p if p.starts_with('?') => format!("/{}", p),
        p => p.to_string(),
    };

    // Drop userinfo if present
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = split_authority(authority, Some(80))?;
    Ok((Address::from_host(&host, port), path))
}

/// Parse `host:port` or `[v6]:port`, using `default_port` when absent.
fn split_authority(authority: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let bad = || Error::protocol(format!("invalid authority: {:?}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(bad)?;
        let host = &rest[..close];
        let port = match &rest[close + 1..] {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or_else(bad)?),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(bad());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| bad())?,
        None => default_port.ok_or_else(bad)?,
    };
    if port == 0 {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}
