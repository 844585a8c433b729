//! UDP protocol - RFC 768

use crate::{Error, Result};

/// UDP header size (fixed)
pub const HEADER_SIZE: usize = 8;

/// Checksum field offset within the header
pub const CHECKSUM_OFFSET: usize = 6;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }

        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// 0 means "not computed", which is valid for UDP over IPv4
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_header() {
        let data = [0x30, 0x39, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00];
        let header = UdpHeader::parse(&data).unwrap();
        assert_eq!(header.src_port(), 12345);
        assert_eq!(header.dst_port(), 53);
        assert_eq!(header.length(), 8);
        assert_eq!(header.checksum(), 0);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(UdpHeader::parse(&[0u8; 7]).is_err());
    }
}
