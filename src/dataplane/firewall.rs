//! Firewall instance
//!
//! Owns every data plane component for the two interfaces and the rings
//! between them. Frames enter through [`Firewall::receive`], are moved along
//! by [`Firewall::poll`] and leave through [`Firewall::transmit`]; the ARP
//! retry timer is [`Firewall::tick`]. All calls happen on one thread, so the
//! rings always have a single producer and a single consumer.
//!
//! Ingress pipeline of one interface:
//!
//! ```text
//! device -> rx ring -> classify --ARP--> responder / requester
//!                          |
//!                          +--IPv4--> NAT --> router ring -> router -> egress lanes
//! ```

use super::arp_processor::{ArpRequester, ArpResponder};
use super::buffer::{BufferDescriptor, BufferPool};
use super::icmp_generator::{IcmpGenerator, IcmpRequest};
use super::interface::{InterfaceId, InterfaceInfo};
use super::napt::{NatOutcome, NatProtocol, NatTranslator};
use super::notify::CountingNotify;
use super::ring::{self, Consumer, Producer};
use super::router::{Router, RouterContext};
use super::routing::RoutingTable;
use crate::config::{Config, LimitsConfig};
use crate::protocol::arp::ArpPacket;
use crate::protocol::ethernet;
use crate::protocol::ipv4::Ipv4Header;
use crate::protocol::EtherType;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result, TableError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Producers of the lanes owned directly by the instance, per egress
struct EdgeLanes {
    responder: Producer<BufferDescriptor>,
    requester: Producer<BufferDescriptor>,
    icmp: Producer<BufferDescriptor>,
}

/// Where an IPv4 frame goes after the NAT stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Route,
    Local,
    Drop,
}

pub struct Firewall {
    interfaces: [InterfaceInfo; 2],
    limits: LimitsConfig,
    pool: BufferPool,
    /// Device to instance, per ingress
    rx: [(Producer<BufferDescriptor>, Consumer<BufferDescriptor>); 2],
    /// NAT stage to router, per ingress
    routed: [Producer<BufferDescriptor>; 2],
    routers: [Router; 2],
    requesters: [ArpRequester; 2],
    responders: [ArpResponder; 2],
    nat: [NatTranslator; 3],
    icmp: IcmpGenerator,
    edge: [EdgeLanes; 2],
    /// Every lane feeding a device, per egress
    lanes: [Vec<Consumer<BufferDescriptor>>; 2],
    wake: CountingNotify,
    metrics: Arc<MetricsRegistry>,
}

impl Firewall {
    /// Build an instance from a configuration. Run
    /// [`crate::config::validate`] first for readable diagnostics.
    pub fn new(config: &Config) -> Result<Self> {
        let limits = config.limits;
        let metrics = Arc::new(MetricsRegistry::new());

        let interfaces = [
            interface_info(config, InterfaceId::External)?,
            interface_info(config, InterfaceId::Internal)?,
        ];

        let mut requesters = InterfaceId::ALL.map(|id| {
            ArpRequester::new(
                id,
                interfaces[id.index()],
                limits.arp_entries,
                limits.arp_max_retries,
                metrics.clone(),
            )
        });
        let responders =
            InterfaceId::ALL.map(|id| ArpResponder::new(id, interfaces[id.index()], metrics.clone()));

        let mut lanes: [Vec<Consumer<BufferDescriptor>>; 2] = [Vec::new(), Vec::new()];
        let mut lane = |egress: InterfaceId| {
            let (producer, consumer) = ring::channel(limits.ring_capacity);
            lanes[egress.index()].push(consumer);
            producer
        };

        let edge = InterfaceId::ALL.map(|id| EdgeLanes {
            responder: lane(id),
            requester: lane(id),
            icmp: lane(id),
        });

        let mut routers = Vec::with_capacity(2);
        let mut routed = Vec::with_capacity(2);
        for id in InterfaceId::ALL {
            let routing = build_routing_table(config, id, &interfaces)?;
            let arp = [
                requesters[0].connect(limits.ring_capacity)?,
                requesters[1].connect(limits.ring_capacity)?,
            ];
            let (input, rx) = ring::channel(limits.ring_capacity);
            let tx = [lane(InterfaceId::External), lane(InterfaceId::Internal)];
            routers.push(Router::new(
                id,
                interfaces,
                routing,
                limits.pending_packets,
                arp,
                rx,
                tx,
                metrics.clone(),
            ));
            routed.push(input);
        }

        let mut nat = NatProtocol::ALL.map(NatTranslator::new);
        for id in InterfaceId::ALL {
            if let Some(cfg) = &config.interface(id).nat {
                for translator in nat.iter_mut() {
                    translator.enable(id, cfg.address, cfg.base_port, cfg.capacity)?;
                }
                info!(
                    "Source NAT on {} as {} (ports {}..{})",
                    id,
                    cfg.address,
                    cfg.base_port,
                    cfg.base_port as usize + cfg.capacity
                );
            }
        }

        let icmp = IcmpGenerator::new(
            limits.icmp_queue,
            [interfaces[0].ip_addr, interfaces[1].ip_addr],
        );

        let routers: [Router; 2] = routers
            .try_into()
            .map_err(|_| Error::Config("router construction".into()))?;
        let routed: [Producer<BufferDescriptor>; 2] = routed
            .try_into()
            .map_err(|_| Error::Config("router construction".into()))?;

        for id in InterfaceId::ALL {
            info!(
                "{} {}/{} ({}), {} routes",
                id,
                interfaces[id.index()].ip_addr,
                interfaces[id.index()].prefix_len,
                interfaces[id.index()].mac_addr,
                routers[id.index()].routing().len()
            );
        }

        Ok(Self {
            interfaces,
            limits,
            pool: BufferPool::new(limits.buffers, limits.buffer_size),
            rx: [
                ring::channel(limits.ring_capacity),
                ring::channel(limits.ring_capacity),
            ],
            routed,
            routers,
            requesters,
            responders,
            nat,
            icmp,
            edge,
            lanes,
            wake: CountingNotify::new(),
            metrics,
        })
    }

    pub fn interface_info(&self, interface: InterfaceId) -> &InterfaceInfo {
        &self.interfaces[interface.index()]
    }

    /// Router for frames arriving on `interface`
    pub fn router(&self, interface: InterfaceId) -> &Router {
        &self.routers[interface.index()]
    }

    pub fn router_mut(&mut self, interface: InterfaceId) -> &mut Router {
        &mut self.routers[interface.index()]
    }

    pub fn requester(&self, interface: InterfaceId) -> &ArpRequester {
        &self.requesters[interface.index()]
    }

    pub fn requester_mut(&mut self, interface: InterfaceId) -> &mut ArpRequester {
        &mut self.requesters[interface.index()]
    }

    pub fn nat(&self, protocol: NatProtocol) -> &NatTranslator {
        &self.nat[protocol as usize]
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Hand a frame received on `interface` to the instance. Returns false
    /// (and counts a drop) when no buffer or ring slot is free.
    pub fn receive(&mut self, interface: InterfaceId, frame: &[u8]) -> bool {
        let stats = self.metrics.interface(interface);
        stats.record_rx(frame.len());

        let Some(desc) = self.pool.alloc_from(frame) else {
            trace!("No buffer for {} byte frame on {}", frame.len(), interface);
            stats.rx_drops.inc();
            return false;
        };
        if let Err(desc) = self.rx[interface.index()].0.enqueue(desc) {
            self.pool.free(desc);
            stats.rx_drops.inc();
            return false;
        }
        true
    }

    /// Run one bounded pass over every stage. Returns the amount of work
    /// done; zero means the instance is idle.
    pub fn poll(&mut self) -> usize {
        let batch = self.limits.batch;
        let mut work = 0;

        for id in InterfaceId::ALL {
            for _ in 0..batch {
                let Some(desc) = self.rx[id.index()].1.dequeue() else {
                    break;
                };
                self.ingress(id, desc);
                work += 1;
            }
        }

        for id in InterfaceId::ALL {
            let requester = &mut self.requesters[id.index()];
            work += requester.process(batch, &mut self.pool, &self.edge[id.index()].requester);
        }

        for id in InterfaceId::ALL {
            let mut ctx = RouterContext {
                pool: &mut self.pool,
                caches: [self.requesters[0].cache(), self.requesters[1].cache()],
                icmp: &self.icmp,
            };
            work += self.routers[id.index()].process(batch, &mut ctx);
        }

        // Requests raised by the routers in this pass
        for id in InterfaceId::ALL {
            let requester = &mut self.requesters[id.index()];
            work += requester.process(batch, &mut self.pool, &self.edge[id.index()].requester);
        }

        for id in InterfaceId::ALL {
            let sent = self
                .icmp
                .drain(id, &mut self.pool, &self.edge[id.index()].icmp);
            self.metrics.interface(id).icmp_sent.add(sent as u64);
            work += sent;
        }

        work
    }

    /// True if frames or notifications are waiting for another [`poll`].
    ///
    /// [`poll`]: Firewall::poll
    pub fn needs_poll(&self) -> bool {
        let woken = self.wake.take() > 0;
        woken
            || self.rx.iter().any(|(_, rx)| !rx.is_empty())
            || self.routers.iter().any(|r| r.has_input())
            || InterfaceId::ALL.iter().any(|&id| self.icmp.pending(id) > 0)
    }

    /// Pass every frame queued for `interface` to `send`, then release its
    /// buffer. A failed send is counted as a transmit error. Returns the
    /// number of frames sent.
    pub fn transmit<F>(&mut self, interface: InterfaceId, mut send: F) -> usize
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        let stats = self.metrics.interface(interface);
        let mut sent = 0;

        for lane in &self.lanes[interface.index()] {
            while let Some(desc) = lane.dequeue() {
                let frame = self.pool.bytes_mut(desc);
                let len = frame.len();
                match send(frame) {
                    Ok(()) => {
                        stats.record_tx(len);
                        sent += 1;
                    }
                    Err(e) => {
                        debug!("Transmit on {} failed: {}", interface, e);
                        stats.tx_errors.inc();
                    }
                }
                self.pool.free(desc);
            }
            lane.notify_producer(&self.wake);
        }
        sent
    }

    /// ARP retry timer, driven every `limits.arp_tick_ms`.
    pub fn tick(&mut self) {
        for id in InterfaceId::ALL {
            self.requesters[id.index()].tick(&mut self.pool, &self.edge[id.index()].requester);
        }
    }

    /// Refresh the gauges and export every metric
    pub fn stats(&self) -> Vec<(String, u64)> {
        let metrics = &self.metrics;
        metrics
            .arp_entries
            .set(self.requesters.iter().map(|r| r.cache().len()).sum());
        metrics
            .pending_packets
            .set(self.routers.iter().map(|r| r.pending().len()).sum());
        metrics.route_count.set(
            self.routers
                .iter()
                .map(|r| r.routing().len())
                .sum::<usize>(),
        );
        metrics.nat_mappings.set(
            self.nat
                .iter()
                .flat_map(|t| InterfaceId::ALL.map(|id| t.interface(id).map_or(0, |n| n.table.len())))
                .sum(),
        );
        metrics.export()
    }

    fn ingress(&mut self, interface: InterfaceId, desc: BufferDescriptor) {
        let info = self.interfaces[interface.index()];
        let header = ethernet::Frame::parse(self.pool.bytes(desc))
            .map(|frame| (frame.dst_mac(), EtherType::from_u16(frame.ethertype())));
        let (dst_mac, ethertype) = match header {
            Ok(fields) => fields,
            Err(e) => {
                trace!("Dropping runt frame on {}: {}", interface, e);
                self.drop_frame(interface, desc);
                return;
            }
        };

        match ethertype {
            Some(EtherType::Arp) => self.ingress_arp(interface, desc),
            Some(EtherType::Ipv4) if dst_mac == info.mac_addr => self.ingress_ipv4(interface, desc),
            _ => self.pool.free(desc),
        }
    }

    fn ingress_arp(&mut self, interface: InterfaceId, desc: BufferDescriptor) {
        let packet = ethernet::Frame::parse(self.pool.bytes(desc))
            .and_then(|frame| ArpPacket::parse(frame.payload()));
        self.pool.free(desc);

        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Malformed ARP packet on {}: {}", interface, e);
                self.metrics.interface(interface).rx_drops.inc();
                return;
            }
        };

        self.responders[interface.index()].process(
            &packet,
            &mut self.pool,
            &self.edge[interface.index()].responder,
        );
        self.requesters[interface.index()].process_reply(&packet);
    }

    fn ingress_ipv4(&mut self, interface: InterfaceId, desc: BufferDescriptor) {
        let own_ip = self.interfaces[interface.index()].ip_addr;
        let routing = self.routers[interface.index()].routing();
        let stats = self.metrics.interface(interface);

        let frame = self.pool.bytes_mut(desc);
        let verdict = match frame.get_mut(ethernet::HEADER_SIZE..) {
            Some(packet) => translate(&mut self.nat, interface, own_ip, routing, packet),
            None => Err(Error::InvalidPacket("no IPv4 header".into())),
        };

        match verdict {
            Ok((Verdict::Route, translated)) => {
                if translated {
                    stats.nat_translated.inc();
                }
                if let Err(desc) = self.routed[interface.index()].enqueue(desc) {
                    trace!("Router ring full on {}", interface);
                    self.drop_frame(interface, desc);
                }
            }
            Ok((Verdict::Local, _)) => self.deliver_local(interface, desc),
            Ok((Verdict::Drop, _)) => {
                stats.nat_no_mapping.inc();
                self.drop_frame(interface, desc);
            }
            Err(Error::Table(TableError::Full)) => {
                warn!("NAT port range exhausted on {}", interface);
                stats.nat_exhausted.inc();
                self.drop_frame(interface, desc);
            }
            Err(e) => {
                debug!("Dropping IPv4 frame on {}: {}", interface, e);
                self.drop_frame(interface, desc);
            }
        }
    }

    /// Frames addressed to the interface itself. Only echo requests are
    /// answered.
    fn deliver_local(&mut self, interface: InterfaceId, desc: BufferDescriptor) {
        match IcmpRequest::echo_reply(self.pool.bytes(desc)) {
            Ok(reply) => {
                if self.icmp.enqueue(interface, reply).is_err() {
                    self.metrics.interface(interface).icmp_dropped.inc();
                }
            }
            Err(e) => trace!("Ignoring local frame on {}: {}", interface, e),
        }
        self.pool.free(desc);
    }

    fn drop_frame(&mut self, interface: InterfaceId, desc: BufferDescriptor) {
        self.metrics.interface(interface).rx_drops.inc();
        self.pool.free(desc);
    }
}

impl std::fmt::Debug for Firewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firewall")
            .field("interfaces", &self.interfaces)
            .field("pool", &self.pool)
            .field("routers", &self.routers)
            .field("requesters", &self.requesters)
            .field("nat", &self.nat)
            .finish_non_exhaustive()
    }
}

fn interface_info(config: &Config, id: InterfaceId) -> Result<InterfaceInfo> {
    let iface = config.interface(id);
    let (ip_addr, prefix_len) = iface.cidr()?;
    Ok(InterfaceInfo {
        mac_addr: iface.mac,
        ip_addr,
        prefix_len,
    })
}

/// Routes used by the router of `ingress`: both connected subnets first,
/// then the configured routes in file order.
fn build_routing_table(
    config: &Config,
    ingress: InterfaceId,
    interfaces: &[InterfaceInfo; 2],
) -> Result<RoutingTable> {
    let limits = &config.limits;
    let mut table = RoutingTable::with_max_indirections(limits.routes, limits.max_indirections);

    for id in InterfaceId::ALL {
        let info = &interfaces[id.index()];
        table.add_route(id, info.ip_addr, info.prefix_len, None)?;
    }

    for route in &config.interface(ingress).routes {
        let (network, prefix_len) = route.cidr()?;
        match table.add_route(route.interface, network, prefix_len, route.gateway) {
            Ok(_) => {}
            Err(TableError::Duplicate) => {
                warn!(
                    "{}: route {} duplicates a connected route, skipped",
                    ingress, route.destination
                );
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "interfaces.{}: route {}: {}",
                    ingress, route.destination, e
                )));
            }
        }
    }
    Ok(table)
}

/// NAT stage for an IPv4 `packet` that arrived on `interface`.
///
/// Return traffic is reverse translated first. Traffic to the interface
/// address stays local. Anything routed out through the mirror interface is
/// source translated, unless the router is about to expire it. The flag
/// reports whether the packet was rewritten.
fn translate(
    nat: &mut [NatTranslator; 3],
    interface: InterfaceId,
    own_ip: Ipv4Addr,
    routing: &RoutingTable,
    packet: &mut [u8],
) -> Result<(Verdict, bool)> {
    let (dst, ttl) = {
        let header = Ipv4Header::parse(packet)?;
        (header.dst_addr(), header.ttl())
    };

    for translator in nat.iter() {
        match translator.reverse_translate(interface, packet)? {
            NatOutcome::Translated { .. } => return Ok((Verdict::Route, true)),
            NatOutcome::NoMapping if dst == own_ip => return Ok((Verdict::Local, false)),
            NatOutcome::NoMapping => return Ok((Verdict::Drop, false)),
            NatOutcome::Disabled | NatOutcome::NotApplicable => {}
        }
    }

    if dst == own_ip {
        return Ok((Verdict::Local, false));
    }

    // Mappings are never evicted; don't spend one on a packet that dies here
    if ttl <= 1 || routing.find_route(dst) != Some(interface.mirror()) {
        return Ok((Verdict::Route, false));
    }
    for translator in nat.iter_mut() {
        match translator.apply_source_nat(interface, packet)? {
            NatOutcome::Translated { .. } => return Ok((Verdict::Route, true)),
            NatOutcome::Disabled => break,
            NatOutcome::NotApplicable | NatOutcome::NoMapping => {}
        }
    }
    Ok((Verdict::Route, false))
}
