//! Destination addressing
//!
//! [`AddressSpec`] is the single representation of a destination used across
//! the crate: it is built once at the socket layer (from a recovered
//! `SocketAddr` or control-message bytes) and carried into the SOCKS5 request
//! and the UDP relay envelope.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::NegotiationError;
use crate::socks5::common::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, MAX_DOMAIN_LEN};

/// Transport of an intercepted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A destination: IPv4 or IPv6 literal, or a domain name, each with a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressSpec {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl AddressSpec {
    /// Build from raw address bytes: 4 bytes is IPv4, 16 bytes is IPv6
    /// (IPv4-mapped IPv6 collapses to IPv4).
    ///
    /// # Errors
    ///
    /// Returns `NegotiationError::AddressInvalid` for any other length.
    pub fn from_ip_bytes(bytes: &[u8], port: u16) -> Result<Self, NegotiationError> {
        if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
            return Ok(Self::Ipv4(Ipv4Addr::from(v4), port));
        }
        if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
            return Ok(Self::from_ip(IpAddr::V6(Ipv6Addr::from(v6)), port));
        }
        Err(NegotiationError::AddressInvalid(format!(
            "{}-byte address is neither IPv4 nor IPv6",
            bytes.len()
        )))
    }

    /// Build from an IP address, collapsing IPv4-mapped IPv6 to IPv4
    #[must_use]
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::Ipv4(v4, port),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::Ipv4(v4, port),
                None => Self::Ipv6(v6, port),
            },
        }
    }

    /// Parse a host string: IP literals become `Ipv4`/`Ipv6`, anything else a domain.
    ///
    /// # Errors
    ///
    /// Returns `AddressInvalid` for an empty host and `NameTooLong` for
    /// names over 255 bytes.
    pub fn parse(host: &str, port: u16) -> Result<Self, NegotiationError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NegotiationError::AddressInvalid("empty host".into()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip, port));
        }
        if host.len() > MAX_DOMAIN_LEN {
            return Err(NegotiationError::NameTooLong(host.len()));
        }
        Ok(Self::Domain(host.to_owned(), port))
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Ipv4(_, port) | Self::Ipv6(_, port) | Self::Domain(_, port) => *port,
        }
    }

    /// Same host with a different port
    #[must_use]
    pub fn with_port(self, port: u16) -> Self {
        match self {
            Self::Ipv4(ip, _) => Self::Ipv4(ip, port),
            Self::Ipv6(ip, _) => Self::Ipv6(ip, port),
            Self::Domain(name, _) => Self::Domain(name, port),
        }
    }

    /// Collapse an IPv4-mapped `Ipv6` value to `Ipv4`; other values are unchanged
    #[must_use]
    pub fn canonical(self) -> Self {
        match self {
            Self::Ipv6(ip, port) => Self::from_ip(IpAddr::V6(ip), port),
            other => other,
        }
    }

    /// IPv4 form of a literal that fits in 4 bytes, including mapped IPv6
    fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Ipv4(ip, _) => Some(*ip),
            Self::Ipv6(ip, _) => ip.to_ipv4_mapped(),
            Self::Domain(..) => None,
        }
    }

    /// SOCKS5 address-type tag. Mapped IPv6 literals are tagged IPv4.
    #[must_use]
    pub fn atyp(&self) -> u8 {
        match self {
            Self::Domain(..) => ATYP_DOMAIN,
            _ if self.as_ipv4().is_some() => ATYP_IPV4,
            _ => ATYP_IPV6,
        }
    }

    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(..))
    }

    /// Socket address for literal destinations; `None` for domains
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Self::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            Self::Domain(..) => None,
        }
    }

    /// Length of the ATYP + address + port encoding
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Domain(name, _) => 1 + 1 + name.len() + 2,
            _ if self.as_ipv4().is_some() => 1 + 4 + 2,
            _ => 1 + 16 + 2,
        }
    }

    /// Append `ATYP | ADDR | PORT` to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `NameTooLong` for names over 255 bytes and `AddressInvalid`
    /// for an empty name. Nothing is written on error.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), NegotiationError> {
        if let Some(ip) = self.as_ipv4() {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
            buf.put_u16(self.port());
            return Ok(());
        }
        match self {
            // Written above
            Self::Ipv4(..) => {}
            Self::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Self::Domain(name, port) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| NegotiationError::NameTooLong(name.len()))?;
                if len == 0 {
                    return Err(NegotiationError::AddressInvalid("empty domain name".into()));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Decode `ATYP | ADDR | PORT` from the start of `buf`, returning the
    /// address and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `AddressInvalid` on truncation, an unknown ATYP or a
    /// non-UTF-8 domain.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), NegotiationError> {
        let truncated = || NegotiationError::AddressInvalid("truncated address field".into());
        let (&atyp, rest) = buf.split_first().ok_or_else(truncated)?;

        let (addr_len, addr_start) = match atyp {
            ATYP_IPV4 => (4, 1),
            ATYP_IPV6 => (16, 1),
            ATYP_DOMAIN => (usize::from(*rest.first().ok_or_else(truncated)?), 2),
            other => {
                return Err(NegotiationError::AddressInvalid(format!(
                    "unknown address type {other:#04x}"
                )))
            }
        };

        let end = addr_start + addr_len + 2;
        if buf.len() < end {
            return Err(truncated());
        }
        let addr = &buf[addr_start..addr_start + addr_len];
        let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);

        let address = if atyp == ATYP_DOMAIN {
            let name = std::str::from_utf8(addr)
                .map_err(|_| NegotiationError::AddressInvalid("domain is not UTF-8".into()))?;
            Self::Domain(name.to_owned(), port)
        } else {
            Self::from_ip_bytes(addr, port)?
        };

        Ok((address, end))
    }

    /// Read `ATYP | ADDR | PORT` from a stream.
    ///
    /// # Errors
    ///
    /// Returns `AddressInvalid` for an unknown ATYP and `Io` if the stream
    /// fails or ends early.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, NegotiationError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader
            .read_u8()
            .await
            .map_err(|e| NegotiationError::io("read address type", e))?;

        let addr_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => usize::from(
                reader
                    .read_u8()
                    .await
                    .map_err(|e| NegotiationError::io("read domain length", e))?,
            ),
            other => {
                return Err(NegotiationError::AddressInvalid(format!(
                    "unknown address type {other:#04x}"
                )))
            }
        };

        let mut addr = vec![0u8; addr_len];
        reader
            .read_exact(&mut addr)
            .await
            .map_err(|e| NegotiationError::io("read address", e))?;
        let port = reader
            .read_u16()
            .await
            .map_err(|e| NegotiationError::io("read port", e))?;

        if atyp == ATYP_DOMAIN {
            let name = String::from_utf8(addr)
                .map_err(|_| NegotiationError::AddressInvalid("domain is not UTF-8".into()))?;
            return Ok(Self::Domain(name, port));
        }
        Self::from_ip_bytes(&addr, port)
    }
}

impl From<SocketAddr> for AddressSpec {
    fn from(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            Self::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}
