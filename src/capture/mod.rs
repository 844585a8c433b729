//! Device I/O
//!
//! Raw Ethernet sockets connecting the firewall instance to kernel devices.
//! The data plane leaves rewritten checksums zeroed; [`fill_checksums`]
//! completes them just before a frame hits the wire.

mod af_packet;

pub use af_packet::AfPacketSocket;

use crate::protocol::checksum::{internet_checksum, pseudo_header_checksum};
use crate::protocol::ipv4::{self, Ipv4HeaderMut, Protocol};
use crate::protocol::{ethernet, icmp, tcp, udp, EtherType};
use crate::Result;
use std::future::Future;

/// Frame-level device backend
pub trait Capture: Send + Sync {
    /// Wait for and receive one frame into `buf`, returning its length
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Send one frame without waiting
    fn try_send(&self, frame: &[u8]) -> Result<()>;
}

/// Complete the checksums of an outgoing IPv4 frame.
///
/// The IPv4 header checksum is always recomputed. TCP, UDP and ICMP
/// checksums are computed only when zero; a correct non-zero checksum is
/// left as is. Non-IPv4 frames and non-first fragments are untouched.
pub fn fill_checksums(frame: &mut [u8]) {
    let is_ipv4 = ethernet::Frame::parse(frame)
        .map(|f| f.ethertype() == EtherType::Ipv4 as u16)
        .unwrap_or(false);
    if !is_ipv4 {
        return;
    }

    let packet = &mut frame[ethernet::HEADER_SIZE..];
    if packet.len() < ipv4::MIN_HEADER_SIZE {
        return;
    }
    // Ethernet padding is not part of the datagram
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    let end = total_len.min(packet.len());

    let Ok(mut ip) = Ipv4HeaderMut::parse(&mut packet[..end]) else {
        return;
    };
    ip.fill_checksum();
    if fragment_offset != 0 {
        return;
    }

    let (src, dst, protocol) = (ip.src_addr(), ip.dst_addr(), ip.protocol());
    let segment = ip.payload_mut();
    let offset = match Protocol::from_u8(protocol) {
        Some(Protocol::Tcp) if segment.len() >= tcp::MIN_HEADER_SIZE => tcp::CHECKSUM_OFFSET,
        Some(Protocol::Udp) if segment.len() >= udp::HEADER_SIZE => udp::CHECKSUM_OFFSET,
        Some(Protocol::Icmp) if segment.len() >= icmp::HEADER_SIZE => icmp::CHECKSUM_OFFSET,
        _ => return,
    };
    if segment[offset..offset + 2] != [0, 0] {
        return;
    }

    let sum = match Protocol::from_u8(protocol) {
        Some(Protocol::Icmp) => internet_checksum(segment),
        // Zero means "no checksum" for UDP
        Some(Protocol::Udp) => match pseudo_header_checksum(src, dst, protocol, segment) {
            0 => 0xffff,
            sum => sum,
        },
        _ => pseudo_header_checksum(src, dst, protocol, segment),
    };
    segment[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}
