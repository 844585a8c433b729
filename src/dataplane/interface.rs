//! The two mirrored interfaces

use crate::protocol::MacAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// One of the two firewall interfaces. Each is the mirror of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceId {
    External = 0,
    Internal = 1,
}

impl InterfaceId {
    pub const ALL: [InterfaceId; 2] = [InterfaceId::External, InterfaceId::Internal];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(InterfaceId::External),
            1 => Some(InterfaceId::Internal),
            _ => None,
        }
    }

    /// The paired interface
    pub fn mirror(self) -> Self {
        match self {
            InterfaceId::External => InterfaceId::Internal,
            InterfaceId::Internal => InterfaceId::External,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceId::External => "external",
            InterfaceId::Internal => "internal",
        }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub mac_addr: MacAddr,
    pub ip_addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl InterfaceInfo {
    /// Whether `addr` is on this interface's directly attached subnet
    pub fn is_on_link(&self, addr: Ipv4Addr) -> bool {
        let mask = super::routing::prefix_mask(self.prefix_len);
        u32::from(addr) & mask == u32::from(self.ip_addr) & mask
    }
}
