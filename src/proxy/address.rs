//! Destination address codec.
//!
//! Wire format (SOCKS5-style):
//! ```text
//! ┌──────┬──────────────────────────────────────┬──────────────┐
//! │ ATYP │ 0x01: IPv4 (4)                       │ Port (2, BE) │
//! │      │ 0x03: Len (1) + Domain (1..=255)     │              │
//! │      │ 0x04: IPv6 (16)                      │              │
//! └──────┴──────────────────────────────────────┴──────────────┘
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::transport::ChunkReader;

/// Address type: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// A destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IP address and port
    Socket(SocketAddr),
    /// Domain name and port, resolved by the server
    Domain(String, u16),
}

impl Address {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.encoded_len());
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(host, _) => {
                if host.is_empty() || host.len() > 255 {
                    return Err(Error::framing(format!(
                        "domain length {} out of range",
                        host.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }

    /// Encode to a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse an address from the start of `payload`.
    ///
    /// Returns the address and the number of bytes it occupied.
    pub fn parse(payload: &[u8]) -> Result<(Self, usize)> {
        let atyp = *payload
            .first()
            .ok_or_else(|| Error::framing("empty address"))?;

        match atyp {
            ATYP_IPV4 => {
                let body = take(payload, 1, 4 + 2)?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok((Address::Socket(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                let body = take(payload, 1, 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                let ip = Ipv6Addr::from(octets);
                Ok((Address::Socket(SocketAddr::new(IpAddr::V6(ip), port)), 19))
            }
            ATYP_DOMAIN => {
                let len = take(payload, 1, 1)?[0] as usize;
                let body = take(payload, 2, len + 2)?;
                let host = domain(&body[..len])?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                Ok((Address::Domain(host, port), 2 + len + 2))
            }
            other => Err(Error::framing(format!("unknown address type 0x{:02x}", other))),
        }
    }

    /// Read an address from the start of a decrypted stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut ChunkReader<R>) -> Result<Self> {
        let mut atyp = [0u8; 1];
        reader.read_plain_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut body = [0u8; 4 + 2];
                reader.read_plain_exact(&mut body).await?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(Address::Socket(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ATYP_IPV6 => {
                let mut body = [0u8; 16 + 2];
                reader.read_plain_exact(&mut body).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(Address::Socket(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_plain_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut body = vec![0u8; len + 2];
                reader.read_plain_exact(&mut body).await?;
                let host = domain(&body[..len])?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                Ok(Address::Domain(host, port))
            }
            other => Err(Error::framing(format!("unknown address type 0x{:02x}", other))),
        }
    }
}

fn take(payload: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    payload
        .get(start..start + len)
        .ok_or_else(|| Error::framing("address truncated"))
}

fn domain(raw: &[u8]) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::framing("empty domain name"));
    }
    String::from_utf8(raw.to_vec()).map_err(|_| Error::framing("domain name is not UTF-8"))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::framing(format!("missing port in {:?}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::framing(format!("invalid port in {:?}", s)))?;
        if host.is_empty() || host.len() > 255 {
            return Err(Error::framing(format!("invalid host in {:?}", s)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
