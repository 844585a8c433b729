//! Ethernet II header

use super::MacAddr;
use crate::{Error, Result};

/// Ethernet header size (no VLAN tag)
pub const HEADER_SIZE: usize = 14;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.buffer[0..6])
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.buffer[6..12])
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn header(&self) -> &'a [u8] {
        &self.buffer[..HEADER_SIZE]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Mutable view used to rewrite addresses in place
#[derive(Debug)]
pub struct FrameMut<'a> {
    buffer: &'a mut [u8],
}

impl<'a> FrameMut<'a> {
    pub fn parse(buffer: &'a mut [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn set_dst_mac(&mut self, mac: MacAddr) {
        self.buffer[0..6].copy_from_slice(&mac.0);
    }

    pub fn set_src_mac(&mut self, mac: MacAddr) {
        self.buffer[6..12].copy_from_slice(&mac.0);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[HEADER_SIZE..]
    }
}

/// Write an Ethernet header at the start of `buffer`.
pub fn write_header(buffer: &mut [u8], dst: MacAddr, src: MacAddr, ethertype: u16) {
    buffer[0..6].copy_from_slice(&dst.0);
    buffer[6..12].copy_from_slice(&src.0);
    buffer[12..14].copy_from_slice(&ethertype.to_be_bytes());
}
