//! SOCKS5 wire constants (RFC 1928, RFC 1929)

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// Server rejected every offered method
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// Auth reply values treated as success. Servers disagree on whether the
/// first reply byte is the sub-negotiation version or a status, so both
/// 0 and 1 pass.
pub const AUTH_ACCEPTED: [u8; 2] = [0x00, 0x01];

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

/// Longest name a 1-byte length prefix can carry
pub const MAX_DOMAIN_LEN: usize = 255;

/// Port used in a CONNECT request when the target carries port 0
pub const DEFAULT_CONNECT_PORT: u16 = 80;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// UDP envelope header with an IPv4 address: RSV(2) + FRAG(1) + ATYP(1) + ADDR(4) + PORT(2)
pub const UDP_HEADER_IPV4_SIZE: usize = 10;

/// UDP envelope header with an IPv6 address
pub const UDP_HEADER_IPV6_SIZE: usize = 22;

/// Human-readable text for a reply code
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}
