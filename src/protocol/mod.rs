//! Wire formats
//!
//! Ethernet, IPv4, ARP, ICMP, UDP and TCP headers, read and rewritten in place
//! over packet buffers. Multi-byte fields are in network byte order.

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod types;
pub mod udp;

pub use types::*;
