//! IPv4 protocol - RFC 791

use super::checksum::internet_checksum;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Largest IPv4 header (IHL 15)
pub const MAX_HEADER_SIZE: usize = 60;

/// Default TTL for locally generated packets
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

fn header_len_of(buffer: &[u8]) -> Result<usize> {
    if buffer.len() < MIN_HEADER_SIZE {
        return Err(Error::Parse("IPv4 header too short".into()));
    }

    if buffer[0] >> 4 != 4 {
        return Err(Error::Parse("not an IPv4 packet".into()));
    }

    let header_len = (buffer[0] & 0x0F) as usize * 4;
    if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
        return Err(Error::Parse("IPv4 header truncated".into()));
    }

    Ok(header_len)
}

/// Parsed IPv4 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        let header_len = header_len_of(buffer)?;
        Ok(Self { buffer, header_len })
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[10], self.buffer[11]])
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[12],
            self.buffer[13],
            self.buffer[14],
            self.buffer[15],
        )
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[16],
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
        )
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Header bytes including options
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.buffer[..self.header_len]
    }

    /// Payload, bounded by the total length field when it is consistent
    pub fn payload(&self) -> &'a [u8] {
        let end = (self.total_length() as usize).clamp(self.header_len, self.buffer.len());
        &self.buffer[self.header_len..end]
    }

    /// Validate header checksum
    pub fn validate_checksum(&self) -> bool {
        internet_checksum(self.as_bytes()) == 0
    }
}

/// Mutable IPv4 header view for in-place rewriting
#[derive(Debug)]
pub struct Ipv4HeaderMut<'a> {
    buffer: &'a mut [u8],
    header_len: usize,
}

impl<'a> Ipv4HeaderMut<'a> {
    pub fn parse(buffer: &'a mut [u8]) -> Result<Self> {
        let header_len = header_len_of(buffer)?;
        Ok(Self { buffer, header_len })
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[12],
            self.buffer[13],
            self.buffer[14],
            self.buffer[15],
        )
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[16],
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
        )
    }

    /// Decrement TTL. Returns false (and leaves the packet alone) if the
    /// TTL would reach zero.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.buffer[8] <= 1 {
            return false;
        }
        self.buffer[8] -= 1;
        self.clear_checksum();
        true
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[12..16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[16..20].copy_from_slice(&addr.octets());
    }

    /// Zero the header checksum; it is recomputed at the device edge.
    pub fn clear_checksum(&mut self) {
        self.buffer[10] = 0;
        self.buffer[11] = 0;
    }

    /// Recalculate and store the header checksum
    pub fn fill_checksum(&mut self) {
        self.clear_checksum();
        let sum = internet_checksum(&self.buffer[..self.header_len]);
        self.buffer[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.header_len..]
    }
}

/// Write a 20-byte IPv4 header (no options, DF set, checksum zero) at the
/// start of `buffer`.
pub fn write_header(
    buffer: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: Protocol,
    payload_len: usize,
) {
    let total_length = (MIN_HEADER_SIZE + payload_len) as u16;

    // Version (4) + IHL (5)
    buffer[0] = 0x45;
    buffer[1] = 0;
    buffer[2..4].copy_from_slice(&total_length.to_be_bytes());
    buffer[4..6].copy_from_slice(&0u16.to_be_bytes());
    buffer[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    buffer[8] = DEFAULT_TTL;
    buffer[9] = protocol as u8;
    buffer[10] = 0;
    buffer[11] = 0;
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(ttl: u8) -> Vec<u8> {
        let mut packet = vec![0u8; MIN_HEADER_SIZE + 4];
        write_header(
            &mut packet,
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(8, 8, 8, 8),
            Protocol::Udp,
            4,
        );
        packet[8] = ttl;
        packet
    }

    #[test]
    fn test_parse_header() {
        let data = make_packet(64);
        let header = Ipv4Header::parse(&data).unwrap();

        assert_eq!(header.header_len(), 20);
        assert_eq!(header.total_length(), 24);
        assert_eq!(header.ttl(), 64);
        assert_eq!(header.protocol(), Protocol::Udp as u8);
        assert_eq!(header.src_addr(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(header.dst_addr(), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(header.payload().len(), 4);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Ipv4Header::parse(&[0x45; 19]).is_err());

        let mut data = make_packet(64);
        data[0] = 0x65;
        assert!(Ipv4Header::parse(&data).is_err());

        // IHL larger than the buffer
        let mut data = make_packet(64);
        data[0] = 0x4F;
        assert!(Ipv4Header::parse(&data).is_err());
    }

    #[test]
    fn test_decrement_ttl() {
        let mut data = make_packet(2);
        let mut header = Ipv4HeaderMut::parse(&mut data).unwrap();
        assert!(header.decrement_ttl());
        assert_eq!(header.ttl(), 1);
        assert!(!header.decrement_ttl());
        assert_eq!(header.ttl(), 1);
    }

    #[test]
    fn test_rewrite_and_fill_checksum() {
        let mut data = make_packet(64);
        {
            let mut header = Ipv4HeaderMut::parse(&mut data).unwrap();
            header.set_src_addr(Ipv4Addr::new(203, 0, 113, 1));
            header.fill_checksum();
        }

        let header = Ipv4Header::parse(&data).unwrap();
        assert_eq!(header.src_addr(), Ipv4Addr::new(203, 0, 113, 1));
        assert!(header.validate_checksum());
    }
}
