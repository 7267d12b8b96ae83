//! SOCKS5-style destination addresses.
//!
//! The same encoding is used in SOCKS5 requests and as the first payload of
//! every tunnel session:
//!
//! ```text
//! 0x01 | IPv4 (4)  | port (2, BE)
//! 0x03 | len (1)   | domain (len) | port (2, BE)
//! 0x04 | IPv6 (16) | port (2, BE)
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Connection destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IP and port
    Socket(SocketAddr),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Build from a host string, keeping IP literals as socket addresses.
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Host part without the port (IPv6 without brackets).
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Encoded length in bytes.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| Error::protocol("domain name longer than 255 bytes"))?;
                if len == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Wire encoding as a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode from the start of `data`, returning the address and bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let atyp = *data.first().ok_or(Error::Buffer {
            expected: 1,
            actual: 0,
        })?;

        let need = |n: usize| -> Result<()> {
            if data.len() < n {
                Err(Error::Buffer {
                    expected: n,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        match atyp {
            ATYP_IPV4 => {
                need(7)?;
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 7))
            }
            ATYP_IPV6 => {
                need(19)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port)),
                    19,
                ))
            }
            ATYP_DOMAIN => {
                need(2)?;
                let len = data[1] as usize;
                need(2 + len + 2)?;
                let domain = parse_domain(&data[2..2 + len])?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), 4 + len))
            }
            other => Err(Error::protocol(format!("unsupported address type 0x{:02x}", other))),
        }
    }

    /// Read an address whose type byte is `atyp` from an async stream.
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Address::Socket(SocketAddr::new(ip.into(), port)))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port)))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = parse_domain(&buf[..len])?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok(Address::Domain(domain, port))
            }
            other => Err(Error::protocol(format!("unsupported address type 0x{:02x}", other))),
        }
    }
}

fn parse_domain(raw: &[u8]) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::protocol("empty domain name"));
    }
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("domain name is not UTF-8"))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_encoding() {
        let addr = Address::Domain("example.com".into(), 443);
        let bytes = addr.to_bytes().unwrap();

        assert_eq!(bytes[0], ATYP_DOMAIN);
        assert_eq!(bytes[1], 11);
        assert_eq!(&bytes[2..13], b"example.com");
        assert_eq!(&bytes[13..], &[0x01, 0xbb]);
        assert_eq!(bytes.len(), addr.serialized_len());
    }

    #[test]
    fn test_decode_with_trailing_payload() {
        let mut data = Address::from_host("10.1.2.3", 8080).to_bytes().unwrap();
        data.extend_from_slice(b"GET /");

        let (addr, used) = Address::decode(&data).unwrap();
        assert_eq!(addr.to_string(), "10.1.2.3:8080");
        assert_eq!(&data[used..], b"GET /");
    }

    #[test]
    fn test_ipv6_literal() {
        let addr = Address::from_host("[::1]", 53);
        assert!(matches!(addr, Address::Socket(SocketAddr::V6(_))));
        assert_eq!(addr.host(), "::1");

        let (decoded, used) = Address::decode(&addr.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 19);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Address::decode(&[]), Err(Error::Buffer { .. })));
        assert!(matches!(
            Address::decode(&[ATYP_DOMAIN, 10, b'a']),
            Err(Error::Buffer { .. })
        ));
        assert!(matches!(Address::decode(&[0x05, 0, 0]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_overlong_domain_rejected() {
        let addr = Address::Domain("a".repeat(256), 80);
        assert!(addr.to_bytes().is_err());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        // Length-prefixed domain followed by the port
        let bytes = [3, b'a', b'.', b'b', 0x00, 0x50];
        let mut reader = &bytes[..];
        let addr = Address::read_from(&mut reader, ATYP_DOMAIN).await.unwrap();
        assert_eq!(addr, Address::Domain("a.b".into(), 80));
    }
}
