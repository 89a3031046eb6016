//! SOCKS5 UDP relay framing (RFC 1928 section 7)
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! Encoding handles every [`AddressSpec`] variant. Decoding only accepts the
//! fixed IPv4 layout and rejects anything else instead of misparsing it.

use bytes::{BufMut, Bytes, BytesMut};

use super::common::{ATYP_IPV4, UDP_HEADER_IPV4_SIZE};
use crate::address::{AddressSpec, Transport};
use crate::error::{FramingError, NegotiationError};

/// One datagram exchanged with a SOCKS5 UDP relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPacket {
    /// Destination (outbound) or source (inbound) of the payload
    pub address: AddressSpec,
    pub payload: Bytes,
}

impl RelayPacket {
    pub fn new(address: AddressSpec, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            payload: payload.into(),
        }
    }

    /// Wrap the payload in a UDP relay envelope.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedTransport` unless `transport` is UDP, and
    /// `NameTooLong` for domains over 255 bytes.
    pub fn encode(&self, transport: Transport) -> Result<BytesMut, FramingError> {
        if transport != Transport::Udp {
            return Err(FramingError::UnsupportedTransport(transport));
        }

        let mut buf = BytesMut::with_capacity(3 + self.address.encoded_len() + self.payload.len());
        buf.put_u16(0x0000); // RSV
        buf.put_u8(0x00); // FRAG
        self.address.write_to(&mut buf).map_err(|e| match e {
            NegotiationError::NameTooLong(len) => FramingError::NameTooLong(len),
            other => FramingError::InvalidAddress(other.to_string()),
        })?;
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Unwrap an envelope received from the relay.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` for datagrams shorter than the IPv4 header,
    /// `Fragmented` for a non-zero FRAG byte and `UnsupportedAddressType`
    /// for any ATYP other than IPv4.
    pub fn decode(datagram: Bytes) -> Result<Self, FramingError> {
        if datagram.len() < UDP_HEADER_IPV4_SIZE {
            return Err(FramingError::Truncated {
                needed: UDP_HEADER_IPV4_SIZE,
                actual: datagram.len(),
            });
        }
        if datagram[2] != 0 {
            return Err(FramingError::Fragmented(datagram[2]));
        }
        if datagram[3] != ATYP_IPV4 {
            return Err(FramingError::UnsupportedAddressType(datagram[3]));
        }

        let ip = std::net::Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
        let port = u16::from_be_bytes([datagram[8], datagram[9]]);

        Ok(Self {
            address: AddressSpec::Ipv4(ip, port),
            payload: datagram.slice(UDP_HEADER_IPV4_SIZE..),
        })
    }
}
