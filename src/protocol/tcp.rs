//! TCP protocol - RFC 793
//!
//! Only the fields the forwarding path touches: ports and checksum.

use crate::{Error, Result};

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Checksum field offset within the header
pub const CHECKSUM_OFFSET: usize = 16;

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }

        let header_len = (buffer[12] >> 4) as usize * 4;
        if header_len < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP data offset too small".into()));
        }
        if buffer.len() < header_len {
            return Err(Error::Parse("TCP header truncated".into()));
        }

        Ok(Self { buffer, header_len })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[16], self.buffer[17]])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_segment() -> [u8; MIN_HEADER_SIZE] {
        let mut seg = [0u8; MIN_HEADER_SIZE];
        seg[0..2].copy_from_slice(&40000u16.to_be_bytes());
        seg[2..4].copy_from_slice(&443u16.to_be_bytes());
        seg[12] = 0x50;
        seg[16..18].copy_from_slice(&0xbeefu16.to_be_bytes());
        seg
    }

    #[test]
    fn test_parse_tcp_header() {
        let seg = make_segment();
        let header = TcpHeader::parse(&seg).unwrap();
        assert_eq!(header.src_port(), 40000);
        assert_eq!(header.dst_port(), 443);
        assert_eq!(header.checksum(), 0xbeef);
        assert_eq!(header.header_len(), 20);
    }

    #[test]
    fn test_parse_bad_data_offset() {
        let mut seg = make_segment();
        seg[12] = 0x40;
        assert!(TcpHeader::parse(&seg).is_err());

        seg[12] = 0x60;
        assert!(TcpHeader::parse(&seg).is_err());
    }
}
