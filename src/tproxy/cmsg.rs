//! Ancillary data parsing for TPROXY UDP
//!
//! With `IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR` enabled, every datagram
//! read with `recvmsg(2)` carries a control message whose payload is the
//! `sockaddr_in` / `sockaddr_in6` the client originally sent to. This module
//! walks a raw control buffer (as returned in `msg_control`) and extracts that
//! record without touching the socket, so it can be tested on plain bytes.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;

use crate::address::AddressSpec;
use crate::error::RecoveryError;

use super::socket::{IPV6_RECVORIGDSTADDR, IP_RECVORIGDSTADDR};

/// `sockaddr_in` bytes needed to read family, port and address
const SOCKADDR_IN_MIN: usize = 8;

/// `sockaddr_in6` bytes needed to read family, port, flowinfo and address
const SOCKADDR_IN6_MIN: usize = 24;

/// `CMSG_ALIGN`: control messages are padded to the alignment of `size_t`
const fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

/// Size of `struct cmsghdr`
const HEADER_LEN: usize = mem::size_of::<libc::cmsghdr>();

/// Offset of the payload within a control message (`CMSG_DATA`)
const DATA_OFFSET: usize = cmsg_align(HEADER_LEN);

/// Find the original-destination record in a control-message buffer.
///
/// Records are matched at `SOL_IP`/`IP_ORIGDSTADDR` and
/// `SOL_IPV6`/`IPV6_ORIGDSTADDR`; the first match wins.
///
/// # Errors
///
/// - `RecoveryError::Missing` if the buffer is empty or holds no matching record
/// - `RecoveryError::Malformed` if a header is cut short, a length field is
///   inconsistent, or the matching record is too short for its address
pub fn parse_original_dst(control: &[u8]) -> Result<AddressSpec, RecoveryError> {
    let mut offset = 0;

    while offset < control.len() {
        let rest = &control[offset..];
        if rest.len() < HEADER_LEN {
            return Err(RecoveryError::short("control message header", HEADER_LEN, rest.len()));
        }

        // SAFETY: `rest` holds at least one header; read_unaligned has no alignment requirement.
        let header = unsafe { ptr::read_unaligned(rest.as_ptr().cast::<libc::cmsghdr>()) };
        #[allow(clippy::unnecessary_cast)] // size_t on glibc, socklen_t on musl
        let record_len = header.cmsg_len as usize;

        if record_len < HEADER_LEN {
            return Err(RecoveryError::Malformed(format!(
                "control message length {record_len} is smaller than its header"
            )));
        }
        if record_len > rest.len() {
            return Err(RecoveryError::short("control message", record_len, rest.len()));
        }

        let data = rest.get(DATA_OFFSET..record_len).unwrap_or_default();
        match (header.cmsg_level, header.cmsg_type) {
            (libc::SOL_IP, IP_RECVORIGDSTADDR) => return parse_sockaddr_in(data),
            (libc::SOL_IPV6, IPV6_RECVORIGDSTADDR) => return parse_sockaddr_in6(data),
            _ => {}
        }

        offset += cmsg_align(record_len);
    }

    Err(RecoveryError::Missing)
}

fn family(data: &[u8]) -> libc::sa_family_t {
    libc::sa_family_t::from_ne_bytes([data[0], data[1]])
}

fn parse_sockaddr_in(data: &[u8]) -> Result<AddressSpec, RecoveryError> {
    if data.len() < SOCKADDR_IN_MIN {
        return Err(RecoveryError::short("IP_ORIGDSTADDR record", SOCKADDR_IN_MIN, data.len()));
    }
    if i32::from(family(data)) != libc::AF_INET {
        return Err(RecoveryError::Malformed(format!(
            "IP_ORIGDSTADDR record has address family {}",
            family(data)
        )));
    }

    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    Ok(AddressSpec::Ipv4(ip, port))
}

fn parse_sockaddr_in6(data: &[u8]) -> Result<AddressSpec, RecoveryError> {
    if data.len() < SOCKADDR_IN6_MIN {
        return Err(RecoveryError::short("IPV6_ORIGDSTADDR record", SOCKADDR_IN6_MIN, data.len()));
    }
    if i32::from(family(data)) != libc::AF_INET6 {
        return Err(RecoveryError::Malformed(format!(
            "IPV6_ORIGDSTADDR record has address family {}",
            family(data)
        )));
    }

    let port = u16::from_be_bytes([data[2], data[3]]);
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[8..24]);
    Ok(AddressSpec::from_ip(Ipv6Addr::from(octets).into(), port))
}

/// Build one control message the way the kernel lays it out
#[cfg(test)]
pub(crate) fn build_control_message(level: libc::c_int, ty: libc::c_int, data: &[u8]) -> Vec<u8> {
    // SAFETY: cmsghdr is plain data; all-zero is a valid value.
    let mut header: libc::cmsghdr = unsafe { mem::zeroed() };
    header.cmsg_len = (DATA_OFFSET + data.len()) as _;
    header.cmsg_level = level;
    header.cmsg_type = ty;

    let mut buf = vec![0u8; cmsg_align(DATA_OFFSET + data.len())];
    // SAFETY: buf is at least HEADER_LEN bytes long.
    unsafe { ptr::write_unaligned(buf.as_mut_ptr().cast::<libc::cmsghdr>(), header) };
    buf[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
    buf
}

/// `sockaddr_in` bytes for `ip:port`
#[cfg(test)]
pub(crate) fn sockaddr_in_bytes(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    data[..2].copy_from_slice(&(libc::AF_INET as libc::sa_family_t).to_ne_bytes());
    data[2..4].copy_from_slice(&port.to_be_bytes());
    data[4..8].copy_from_slice(&ip.octets());
    data
}
