//! ICMP messages emitted and inspected by the router (RFC 792)
//!
//! ```text
//! +--------+--------+-----------------+
//! |  Type  |  Code  |    Checksum     |
//! +--------+--------+-----------------+
//! |  id / gateway / unused (4 bytes)  |
//! +-----------------------------------+
//! |  body                             |
//! ```

use crate::{Error, Result};

pub const HEADER_SIZE: usize = 8;

pub const CHECKSUM_OFFSET: usize = 2;

/// Bytes of the triggering datagram's payload quoted in error messages
pub const QUOTED_PAYLOAD: usize = 8;

/// Message types the firewall sends or translates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    Redirect = 5,
    EchoRequest = 8,
    TimeExceeded = 11,
}

impl IcmpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            5 => IcmpType::Redirect,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            _ => return None,
        })
    }

    /// Error messages quote the offending datagram; queries do not
    pub fn is_error(self) -> bool {
        matches!(
            self,
            IcmpType::DestinationUnreachable | IcmpType::Redirect | IcmpType::TimeExceeded
        )
    }
}

pub mod dest_unreachable {
    pub const NET_UNREACHABLE: u8 = 0;
    pub const HOST_UNREACHABLE: u8 = 1;
}

pub mod time_exceeded {
    pub const TTL_EXCEEDED: u8 = 0;
}

pub mod redirect {
    pub const NETWORK: u8 = 0;
    pub const HOST: u8 = 1;
}

/// Read-only view over an ICMP message
#[derive(Debug)]
pub struct IcmpPacket<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpPacket<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse(format!(
                "ICMP message of {} bytes is shorter than its header",
                buffer.len()
            )));
        }
        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Echo identifier, which NAT treats as a port
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// Second header word: gateway for redirects, zero for other errors
    pub fn rest_of_header(&self) -> [u8; 4] {
        [self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == IcmpType::EchoRequest as u8
    }
}

/// Write an ICMP header with a zero checksum at the start of `buffer`.
pub fn write_header(buffer: &mut [u8], icmp_type: IcmpType, code: u8, rest: [u8; 4]) {
    buffer[0] = icmp_type as u8;
    buffer[1] = code;
    buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&[0, 0]);
    buffer[4..HEADER_SIZE].copy_from_slice(&rest);
}
