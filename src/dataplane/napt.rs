//! NAPT (Network Address Port Translation) across the two mirrored interfaces
//!
//! Endpoint-independent mapping: a mapping is keyed only by the internal
//! (source IP, source port) pair. Each interface owns one ephemeral-port table
//! per protocol. Packets arriving on an interface are source-translated with
//! that interface's table; return traffic arrives on the mirror interface and
//! is reverse-translated by looking the destination port up in the same table.
//!
//! Both directions zero the IPv4 and transport checksums; the device adapter
//! recomputes them on transmit.

use super::interface::InterfaceId;
use crate::protocol::icmp::IcmpType;
use crate::protocol::ipv4::{Ipv4HeaderMut, Protocol};
use crate::protocol::{icmp, tcp, udp};
use crate::{Error, Result, TableError};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Transport a translator handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatProtocol {
    Udp,
    Tcp,
    /// ICMP echo; the identifier plays the role of the port
    IcmpEcho,
}

impl NatProtocol {
    pub const ALL: [NatProtocol; 3] = [NatProtocol::Udp, NatProtocol::Tcp, NatProtocol::IcmpEcho];

    fn ip_protocol(self) -> Protocol {
        match self {
            NatProtocol::Udp => Protocol::Udp,
            NatProtocol::Tcp => Protocol::Tcp,
            NatProtocol::IcmpEcho => Protocol::Icmp,
        }
    }

    fn min_header(self) -> usize {
        match self {
            NatProtocol::Udp => udp::HEADER_SIZE,
            NatProtocol::Tcp => tcp::MIN_HEADER_SIZE,
            NatProtocol::IcmpEcho => icmp::HEADER_SIZE,
        }
    }

    /// Offsets of (source port, destination port, checksum) in the
    /// transport header
    fn offsets(self) -> (usize, usize, usize) {
        match self {
            NatProtocol::Udp => (0, 2, udp::CHECKSUM_OFFSET),
            NatProtocol::Tcp => (0, 2, tcp::CHECKSUM_OFFSET),
            NatProtocol::IcmpEcho => (4, 4, 2),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NatProtocol::Udp => "udp",
            NatProtocol::Tcp => "tcp",
            NatProtocol::IcmpEcho => "icmp",
        }
    }
}

/// Original endpoint behind an ephemeral port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatPortMapping {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
}

/// Ephemeral port table, indexed by `port - base_port`
///
/// Grows monotonically up to its capacity; mappings are never released.
#[derive(Debug)]
pub struct NatPortTable {
    mappings: Vec<NatPortMapping>,
    capacity: usize,
}

impl NatPortTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            mappings: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Index of an existing mapping for the endpoint
    pub fn lookup(&self, src_ip: Ipv4Addr, src_port: u16) -> Option<usize> {
        self.mappings
            .iter()
            .position(|m| m.src_ip == src_ip && m.src_port == src_port)
    }

    /// Existing index for the endpoint, or a newly appended one
    pub fn get_or_insert(&mut self, src_ip: Ipv4Addr, src_port: u16) -> Result<usize> {
        if let Some(index) = self.lookup(src_ip, src_port) {
            return Ok(index);
        }
        if self.mappings.len() >= self.capacity {
            return Err(TableError::Full.into());
        }
        self.mappings.push(NatPortMapping { src_ip, src_port });
        Ok(self.mappings.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&NatPortMapping> {
        self.mappings.get(index)
    }

    pub fn mappings(&self) -> &[NatPortMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// NAT state of one enabled interface
#[derive(Debug)]
pub struct NatInterface {
    pub address: Ipv4Addr,
    pub base_port: u16,
    pub table: NatPortTable,
}

impl NatInterface {
    pub fn new(address: Ipv4Addr, base_port: u16, capacity: usize) -> Self {
        Self {
            address,
            base_port,
            table: NatPortTable::new(capacity),
        }
    }

    /// Mapping for an ephemeral port, if it falls in the allocated range
    pub fn mapping_for_port(&self, port: u16) -> Option<&NatPortMapping> {
        let index = port.checked_sub(self.base_port)? as usize;
        self.table.get(index)
    }
}

/// Result of a translation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatOutcome {
    /// Packet rewritten; `port` is the ephemeral port (source NAT) or the
    /// restored original port (reverse translation)
    Translated { port: u16 },
    /// NAT is not enabled on the interface
    Disabled,
    /// Not this translator's protocol, or not addressed to the NAT IP
    NotApplicable,
    /// Addressed to the NAT IP but no mapping holds the port
    NoMapping,
}

/// One protocol's translator for both interfaces
#[derive(Debug)]
pub struct NatTranslator {
    protocol: NatProtocol,
    interfaces: [Option<NatInterface>; 2],
}

impl NatTranslator {
    pub fn new(protocol: NatProtocol) -> Self {
        Self {
            protocol,
            interfaces: [None, None],
        }
    }

    /// Enable translation for packets arriving on `interface`. The port
    /// range must fit below 65536.
    pub fn enable(
        &mut self,
        interface: InterfaceId,
        address: Ipv4Addr,
        base_port: u16,
        capacity: usize,
    ) -> Result<()> {
        if base_port as usize + capacity > u16::MAX as usize + 1 {
            return Err(Error::Config(format!(
                "{} NAT on {}: {} ports from {} exceed the port space",
                self.protocol.as_str(),
                interface,
                capacity,
                base_port
            )));
        }
        self.interfaces[interface.index()] = Some(NatInterface::new(address, base_port, capacity));
        debug!(
            protocol = self.protocol.as_str(),
            %interface, %address, base_port, capacity, "NAT enabled"
        );
        Ok(())
    }

    pub fn protocol(&self) -> NatProtocol {
        self.protocol
    }

    pub fn interface(&self, interface: InterfaceId) -> Option<&NatInterface> {
        self.interfaces[interface.index()].as_ref()
    }

    /// Rewrite the source of an IPv4 `packet` that arrived on `interface`.
    ///
    /// On exhaustion returns `Err(Table(Full))` with the packet untouched.
    pub fn apply_source_nat(
        &mut self,
        interface: InterfaceId,
        packet: &mut [u8],
    ) -> Result<NatOutcome> {
        let protocol = self.protocol;
        let Some(nat) = self.interfaces[interface.index()].as_mut() else {
            return Ok(NatOutcome::Disabled);
        };

        let mut ip = Ipv4HeaderMut::parse(packet)?;
        let Some((src_port, _)) = transport_ports(protocol, &mut ip, Direction::Outbound)? else {
            return Ok(NatOutcome::NotApplicable);
        };
        let src_ip = ip.src_addr();

        let index = nat.table.get_or_insert(src_ip, src_port)?;
        // enable() keeps base_port + capacity inside the port space
        let port = nat.base_port + index as u16;

        ip.set_src_addr(nat.address);
        ip.clear_checksum();
        let (src_off, _, csum_off) = protocol.offsets();
        let transport = ip.payload_mut();
        transport[src_off..src_off + 2].copy_from_slice(&port.to_be_bytes());
        transport[csum_off..csum_off + 2].copy_from_slice(&[0, 0]);

        trace!(
            protocol = protocol.as_str(),
            %interface, %src_ip, src_port, port, "source translated"
        );
        Ok(NatOutcome::Translated { port })
    }

    /// Undo source translation for a return `packet` arriving on
    /// `interface`, using the mirror interface's table.
    pub fn reverse_translate(
        &self,
        interface: InterfaceId,
        packet: &mut [u8],
    ) -> Result<NatOutcome> {
        let protocol = self.protocol;
        let Some(nat) = self.interfaces[interface.mirror().index()].as_ref() else {
            return Ok(NatOutcome::Disabled);
        };

        let mut ip = Ipv4HeaderMut::parse(packet)?;
        if ip.dst_addr() != nat.address {
            return Ok(NatOutcome::NotApplicable);
        }
        let Some((_, dst_port)) = transport_ports(protocol, &mut ip, Direction::Inbound)? else {
            return Ok(NatOutcome::NotApplicable);
        };

        let Some(mapping) = nat.mapping_for_port(dst_port).copied() else {
            trace!(
                protocol = protocol.as_str(),
                %interface, dst_port, "no NAT mapping for port"
            );
            return Ok(NatOutcome::NoMapping);
        };

        ip.set_dst_addr(mapping.src_ip);
        ip.clear_checksum();
        let (_, dst_off, csum_off) = protocol.offsets();
        let transport = ip.payload_mut();
        transport[dst_off..dst_off + 2].copy_from_slice(&mapping.src_port.to_be_bytes());
        transport[csum_off..csum_off + 2].copy_from_slice(&[0, 0]);

        trace!(
            protocol = protocol.as_str(),
            %interface, dst_port, original = %mapping.src_ip, "reverse translated"
        );
        Ok(NatOutcome::Translated {
            port: mapping.src_port,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

/// Source and destination "ports" of the packet, or None if the packet is
/// not handled by this protocol.
fn transport_ports(
    protocol: NatProtocol,
    ip: &mut Ipv4HeaderMut<'_>,
    direction: Direction,
) -> Result<Option<(u16, u16)>> {
    if ip.protocol() != protocol.ip_protocol() as u8 {
        return Ok(None);
    }

    let transport = ip.payload_mut();
    if transport.len() < protocol.min_header() {
        return Err(Error::InvalidPacket(format!(
            "{} header truncated",
            protocol.as_str()
        )));
    }

    if protocol == NatProtocol::IcmpEcho {
        // Outbound queries carry the identifier we allocate; inbound we only
        // translate the matching replies.
        let wanted = match direction {
            Direction::Outbound => IcmpType::EchoRequest,
            Direction::Inbound => IcmpType::EchoReply,
        };
        if transport[0] != wanted as u8 {
            return Ok(None);
        }
    }

    let (src_off, dst_off, _) = protocol.offsets();
    let src = u16::from_be_bytes([transport[src_off], transport[src_off + 1]]);
    let dst = u16::from_be_bytes([transport[dst_off], transport[dst_off + 1]]);
    Ok(Some((src, dst)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipv4::{self, Ipv4Header};

    const NAT_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn udp_packet(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        let mut packet = vec![0u8; ipv4::MIN_HEADER_SIZE + udp::HEADER_SIZE + 4];
        ipv4::write_header(&mut packet, src, dst, Protocol::Udp, udp::HEADER_SIZE + 4);
        let l4 = &mut packet[ipv4::MIN_HEADER_SIZE..];
        l4[0..2].copy_from_slice(&sport.to_be_bytes());
        l4[2..4].copy_from_slice(&dport.to_be_bytes());
        l4[4..6].copy_from_slice(&12u16.to_be_bytes());
        l4[6..8].copy_from_slice(&0xbeefu16.to_be_bytes());
        packet[10..12].copy_from_slice(&0xabcdu16.to_be_bytes());
        packet
    }

    fn echo_packet(kind: IcmpType, src: Ipv4Addr, dst: Ipv4Addr, id: u16) -> Vec<u8> {
        let mut packet = vec![0u8; ipv4::MIN_HEADER_SIZE + icmp::HEADER_SIZE];
        ipv4::write_header(&mut packet, src, dst, Protocol::Icmp, icmp::HEADER_SIZE);
        let l4 = &mut packet[ipv4::MIN_HEADER_SIZE..];
        l4[0] = kind as u8;
        l4[2..4].copy_from_slice(&0x1111u16.to_be_bytes());
        l4[4..6].copy_from_slice(&id.to_be_bytes());
        l4[6..8].copy_from_slice(&1u16.to_be_bytes());
        packet
    }

    fn ports(packet: &[u8]) -> (u16, u16) {
        let l4 = &packet[ipv4::MIN_HEADER_SIZE..];
        (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        )
    }

    fn translator(capacity: usize) -> NatTranslator {
        let mut nat = NatTranslator::new(NatProtocol::Udp);
        nat.enable(InterfaceId::Internal, NAT_IP, 40000, capacity)
            .unwrap();
        nat
    }

    #[test]
    fn test_disabled_interface() {
        let mut nat = translator(4);
        let mut packet = udp_packet(PEER, 53, NAT_IP, 40000);
        let before = packet.clone();

        // External has no NAT of its own
        assert_eq!(
            nat.apply_source_nat(InterfaceId::External, &mut packet).unwrap(),
            NatOutcome::Disabled
        );
        // Reverse on Internal consults External's (absent) table
        assert_eq!(
            nat.reverse_translate(InterfaceId::Internal, &mut packet).unwrap(),
            NatOutcome::Disabled
        );
        assert_eq!(packet, before);
    }

    #[test]
    fn test_consecutive_ports_until_full() {
        let mut nat = translator(3);
        for i in 0..3u16 {
            let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 2), 5000 + i, PEER, 53);
            let outcome = nat.apply_source_nat(InterfaceId::Internal, &mut packet).unwrap();
            assert_eq!(outcome, NatOutcome::Translated { port: 40000 + i });
            assert_eq!(ports(&packet).0, 40000 + i);
        }

        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 3), 5000, PEER, 53);
        let before = packet.clone();
        let err = nat
            .apply_source_nat(InterfaceId::Internal, &mut packet)
            .unwrap_err();
        assert!(matches!(err, Error::Table(TableError::Full)));
        assert_eq!(packet, before, "exhaustion leaves the packet untouched");
    }

    #[test]
    fn test_reuses_existing_mapping() {
        let mut nat = translator(2);
        let client = Ipv4Addr::new(10, 0, 0, 2);

        let mut first = udp_packet(client, 5000, PEER, 53);
        let mut second = udp_packet(client, 5000, Ipv4Addr::new(1, 1, 1, 1), 123);
        nat.apply_source_nat(InterfaceId::Internal, &mut first).unwrap();
        let outcome = nat.apply_source_nat(InterfaceId::Internal, &mut second).unwrap();

        assert_eq!(outcome, NatOutcome::Translated { port: 40000 });
        assert_eq!(nat.interface(InterfaceId::Internal).unwrap().table.len(), 1);
    }

    #[test]
    fn test_source_nat_rewrites_and_zeroes_checksums() {
        let mut nat = translator(2);
        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 2), 5000, PEER, 53);
        nat.apply_source_nat(InterfaceId::Internal, &mut packet).unwrap();

        let ip = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(ip.src_addr(), NAT_IP);
        assert_eq!(ip.dst_addr(), PEER);
        assert_eq!(ip.checksum(), 0);
        let l4 = &packet[ipv4::MIN_HEADER_SIZE..];
        assert_eq!(&l4[6..8], &[0, 0]);
        assert_eq!(ports(&packet).1, 53);
    }

    #[test]
    fn test_round_trip_through_mirror() {
        let mut nat = translator(8);
        let client = Ipv4Addr::new(10, 0, 0, 2);

        let mut out = udp_packet(client, 5555, PEER, 53);
        let NatOutcome::Translated { port } =
            nat.apply_source_nat(InterfaceId::Internal, &mut out).unwrap()
        else {
            panic!("expected translation");
        };

        let mut reply = udp_packet(PEER, 53, NAT_IP, port);
        let outcome = nat.reverse_translate(InterfaceId::External, &mut reply).unwrap();
        assert_eq!(outcome, NatOutcome::Translated { port: 5555 });

        let ip = Ipv4Header::parse(&reply).unwrap();
        assert_eq!(ip.dst_addr(), client);
        assert_eq!(ip.src_addr(), PEER);
        assert_eq!(ports(&reply), (53, 5555));
        assert_eq!(ip.checksum(), 0);
    }

    #[test]
    fn test_reverse_outside_allocated_range() {
        let mut nat = translator(8);
        let mut out = udp_packet(Ipv4Addr::new(10, 0, 0, 2), 5555, PEER, 53);
        nat.apply_source_nat(InterfaceId::Internal, &mut out).unwrap();

        // Within capacity but beyond the allocated size
        let mut reply = udp_packet(PEER, 53, NAT_IP, 40001);
        assert_eq!(
            nat.reverse_translate(InterfaceId::External, &mut reply).unwrap(),
            NatOutcome::NoMapping
        );
        let mut below = udp_packet(PEER, 53, NAT_IP, 39999);
        assert_eq!(
            nat.reverse_translate(InterfaceId::External, &mut below).unwrap(),
            NatOutcome::NoMapping
        );
        let mut elsewhere = udp_packet(PEER, 53, Ipv4Addr::new(203, 0, 113, 9), 40000);
        assert_eq!(
            nat.reverse_translate(InterfaceId::External, &mut elsewhere).unwrap(),
            NatOutcome::NotApplicable
        );
    }

    #[test]
    fn test_protocol_mismatch_not_applicable() {
        let mut nat = NatTranslator::new(NatProtocol::Tcp);
        nat.enable(InterfaceId::Internal, NAT_IP, 40000, 4).unwrap();
        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 2), 5000, PEER, 53);
        assert_eq!(
            nat.apply_source_nat(InterfaceId::Internal, &mut packet).unwrap(),
            NatOutcome::NotApplicable
        );
    }

    #[test]
    fn test_icmp_echo_identifier_round_trip() {
        let mut nat = NatTranslator::new(NatProtocol::IcmpEcho);
        nat.enable(InterfaceId::Internal, NAT_IP, 1000, 4).unwrap();
        let client = Ipv4Addr::new(10, 0, 0, 2);

        let mut request = echo_packet(IcmpType::EchoRequest, client, PEER, 0x4242);
        assert_eq!(
            nat.apply_source_nat(InterfaceId::Internal, &mut request).unwrap(),
            NatOutcome::Translated { port: 1000 }
        );
        let l4 = &request[ipv4::MIN_HEADER_SIZE..];
        assert_eq!(u16::from_be_bytes([l4[4], l4[5]]), 1000);
        assert_eq!(&l4[2..4], &[0, 0]);

        let mut reply = echo_packet(IcmpType::EchoReply, PEER, NAT_IP, 1000);
        assert_eq!(
            nat.reverse_translate(InterfaceId::External, &mut reply).unwrap(),
            NatOutcome::Translated { port: 0x4242 }
        );
        let l4 = &reply[ipv4::MIN_HEADER_SIZE..];
        assert_eq!(u16::from_be_bytes([l4[4], l4[5]]), 0x4242);
        assert_eq!(Ipv4Header::parse(&reply).unwrap().dst_addr(), client);

        // Non-echo ICMP is left alone
        let mut unreachable = echo_packet(IcmpType::DestinationUnreachable, client, PEER, 7);
        assert_eq!(
            nat.apply_source_nat(InterfaceId::Internal, &mut unreachable).unwrap(),
            NatOutcome::NotApplicable
        );
    }

    #[test]
    fn test_enable_rejects_port_overflow() {
        let mut nat = NatTranslator::new(NatProtocol::Udp);
        assert!(nat.enable(InterfaceId::Internal, NAT_IP, 65000, 1000).is_err());
        assert!(nat.enable(InterfaceId::Internal, NAT_IP, 65000, 536).is_ok());
    }

    #[test]
    fn test_truncated_transport_header() {
        let mut nat = translator(4);
        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 2), 5000, PEER, 53);
        packet.truncate(ipv4::MIN_HEADER_SIZE + 4);
        assert!(matches!(
            nat.apply_source_nat(InterfaceId::Internal, &mut packet),
            Err(Error::InvalidPacket(_))
        ));
    }
}
