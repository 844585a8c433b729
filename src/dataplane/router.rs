//! IPv4 forwarding for one ingress interface
//!
//! A router consumes frames that arrived on its interface, resolves the
//! egress interface and next hop with its [`RoutingTable`], and looks the
//! next hop up in the egress interface's ARP cache. Unresolved next hops park
//! the frame in the [`PendingPacketQueue`] and ask the egress ARP requester;
//! the requester's answer releases or drops everything parked for that
//! address. Failures are reported to the sender through the ICMP generator.

use super::arp_cache::{ArpCache, ArpResponse, ArpState};
use super::arp_processor::ArpClient;
use super::buffer::{BufferDescriptor, BufferPool};
use super::icmp_generator::{IcmpGenerator, IcmpRequest};
use super::interface::{InterfaceId, InterfaceInfo};
use super::pending::PendingPacketQueue;
use super::ring::{Consumer, Producer};
use super::routing::{NextHop, RoutingTable};
use crate::protocol::ethernet::{self, FrameMut};
use crate::protocol::icmp::{dest_unreachable, redirect, time_exceeded, IcmpType};
use crate::protocol::ipv4::{Ipv4Header, Ipv4HeaderMut, Protocol};
use crate::protocol::MacAddr;
use crate::telemetry::{InterfaceStats, MetricsRegistry};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Shared state a router reads or borrows during one batch
pub struct RouterContext<'a> {
    pub pool: &'a mut BufferPool,
    /// ARP caches indexed by egress interface
    pub caches: [&'a ArpCache; 2],
    pub icmp: &'a IcmpGenerator,
}

/// What happened to one routed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAction {
    /// Handed to the egress ring
    Forwarded { egress: InterfaceId },
    /// Waiting for the next hop to resolve
    Parked { egress: InterfaceId, next_hop: Ipv4Addr },
    TtlExceeded,
    NoRoute,
    HostUnreachable,
    /// Dropped for lack of room or a malformed header
    Dropped,
}

pub struct Router {
    interface: InterfaceId,
    interfaces: [InterfaceInfo; 2],
    routing: RoutingTable,
    pending: PendingPacketQueue,
    /// Connections to the ARP requesters, indexed by egress interface
    arp: [ArpClient; 2],
    rx: Consumer<BufferDescriptor>,
    /// Egress lanes owned by this router, indexed by egress interface
    tx: [Producer<BufferDescriptor>; 2],
    /// Resolution whose parked packets did not all fit in the egress lane
    releasing: [Option<ArpResponse>; 2],
    metrics: Arc<MetricsRegistry>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interface: InterfaceId,
        interfaces: [InterfaceInfo; 2],
        routing: RoutingTable,
        pending_capacity: usize,
        arp: [ArpClient; 2],
        rx: Consumer<BufferDescriptor>,
        tx: [Producer<BufferDescriptor>; 2],
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            interface,
            interfaces,
            routing,
            pending: PendingPacketQueue::new(pending_capacity),
            arp,
            rx,
            tx,
            releasing: [None; 2],
            metrics,
        }
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    pub fn pending(&self) -> &PendingPacketQueue {
        &self.pending
    }

    /// Whether frames or ARP answers are waiting for [`Router::process`]
    pub fn has_input(&self) -> bool {
        let resumable = self
            .releasing
            .iter()
            .zip(&self.tx)
            .any(|(held, tx)| held.is_some() && !tx.is_full());
        resumable
            || !self.rx.is_empty()
            || self.arp.iter().any(|client| !client.responses.is_empty())
    }

    fn stats(&self) -> &InterfaceStats {
        self.metrics.interface(self.interface)
    }

    /// Run one bounded batch: apply ARP answers, then route up to `budget`
    /// frames. Stops early, with a notification requested, if an egress lane
    /// is full. Returns the number of frames routed.
    pub fn process(&mut self, budget: usize, ctx: &mut RouterContext<'_>) -> usize {
        for egress in InterfaceId::ALL {
            let lane = egress.index();
            if let Some(response) = self.releasing[lane].take() {
                if !self.handle_arp_response(egress, response, ctx) {
                    self.releasing[lane] = Some(response);
                    continue;
                }
            }
            while let Some(response) = self.arp[lane].responses.dequeue() {
                if !self.handle_arp_response(egress, response, ctx) {
                    self.releasing[lane] = Some(response);
                    break;
                }
            }
        }

        let mut routed = 0;
        while routed < budget {
            if let Some(full) = self.tx.iter().find(|tx| tx.is_full()) {
                full.request_notification();
                break;
            }
            let Some(desc) = self.rx.dequeue() else {
                break;
            };
            self.route(desc, ctx);
            routed += 1;
        }
        routed
    }

    /// Route one frame. Ownership of `desc` passes to the router: it is
    /// transmitted, parked or freed.
    pub fn route(&mut self, desc: BufferDescriptor, ctx: &mut RouterContext<'_>) -> ForwardAction {
        let (ttl, src, dst) = match header_fields(ctx.pool.bytes(desc)) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("Dropping malformed frame on {}: {}", self.interface, e);
                self.stats().rx_drops.inc();
                ctx.pool.free(desc);
                return ForwardAction::Dropped;
            }
        };

        if ttl <= 1 {
            trace!("TTL expired for {} -> {}", src, dst);
            self.stats().ttl_expired.inc();
            self.notify_sender(
                ctx,
                desc,
                IcmpType::TimeExceeded,
                time_exceeded::TTL_EXCEEDED,
            );
            ctx.pool.free(desc);
            return ForwardAction::TtlExceeded;
        }

        let Some(NextHop {
            interface: egress,
            ip: next_hop,
        }) = self.routing.resolve(dst)
        else {
            debug!("No route to {} on {}", dst, self.interface);
            self.stats().no_route.inc();
            self.notify_sender(
                ctx,
                desc,
                IcmpType::DestinationUnreachable,
                dest_unreachable::NET_UNREACHABLE,
            );
            ctx.pool.free(desc);
            return ForwardAction::NoRoute;
        };

        // Leaving the way it came: the sender could have reached the next
        // hop directly.
        if egress == self.interface
            && next_hop != dst
            && self.interfaces[egress.index()].is_on_link(src)
        {
            self.send_redirect(ctx, desc, next_hop);
        }

        // Anything already parked for this hop goes first
        if self.pending.find_node(next_hop).is_none() {
            let cached = ctx.caches[egress.index()]
                .find_entry(next_hop)
                .map(|entry| (entry.state, entry.mac));
            match cached {
                Some((ArpState::Reachable, mac)) => {
                    return self.forward(ctx.pool, desc, egress, mac);
                }
                Some((ArpState::Unreachable, _)) => {
                    debug!("{} is unreachable on {}", next_hop, egress);
                    self.stats().host_unreachable.inc();
                    self.notify_sender(
                        ctx,
                        desc,
                        IcmpType::DestinationUnreachable,
                        dest_unreachable::HOST_UNREACHABLE,
                    );
                    ctx.pool.free(desc);
                    return ForwardAction::HostUnreachable;
                }
                _ => {}
            }
        }

        self.park(ctx.pool, desc, egress, next_hop)
    }

    fn park(
        &mut self,
        pool: &mut BufferPool,
        desc: BufferDescriptor,
        egress: InterfaceId,
        next_hop: Ipv4Addr,
    ) -> ForwardAction {
        let new_root = self.pending.find_node(next_hop).is_none();
        let requests = &self.arp[egress.index()].requests;
        if new_root && requests.is_full() {
            debug!("ARP request ring full, dropping packet for {}", next_hop);
            self.stats().tx_full.inc();
            pool.free(desc);
            return ForwardAction::Dropped;
        }

        if let Err(e) = self.pending.push(next_hop, desc) {
            debug!("Cannot park packet for {}: {}", next_hop, e);
            self.stats().pending_full.inc();
            pool.free(desc);
            return ForwardAction::Dropped;
        }

        if new_root {
            // Space was checked above and this router is the only producer
            let _ = requests.enqueue(next_hop);
        }
        self.stats().parked.inc();
        trace!("Parked packet for {} on {}", next_hop, egress);
        ForwardAction::Parked { egress, next_hop }
    }

    fn forward(
        &self,
        pool: &mut BufferPool,
        desc: BufferDescriptor,
        egress: InterfaceId,
        mac: MacAddr,
    ) -> ForwardAction {
        let sent = forward_frame(
            pool,
            desc,
            self.interfaces[egress.index()].mac_addr,
            mac,
            &self.tx[egress.index()],
            self.stats(),
        );
        if sent {
            ForwardAction::Forwarded { egress }
        } else {
            ForwardAction::Dropped
        }
    }

    /// Release (or drop) every packet parked for `response.ip`.
    ///
    /// Returns false if the egress lane filled up first. The remaining
    /// packets stay parked in order and a notification is requested; the
    /// caller keeps `response` and tries again on a later pass.
    fn handle_arp_response(
        &mut self,
        egress: InterfaceId,
        response: ArpResponse,
        ctx: &mut RouterContext<'_>,
    ) -> bool {
        let Some(root) = self.pending.find_node(response.ip) else {
            return true;
        };

        match (response.state, response.mac) {
            (ArpState::Reachable, Some(mac)) => {
                let src_mac = self.interfaces[egress.index()].mac_addr;
                let stats = self.metrics.interface(self.interface);
                let tx = &self.tx[egress.index()];
                let mut released = 0;
                loop {
                    if tx.is_full() {
                        tx.request_notification();
                        trace!(
                            "Released {} packets for {}, lane to {} full",
                            released,
                            response.ip,
                            egress
                        );
                        return false;
                    }
                    let Ok((desc, more)) = self.pending.pop_front(root) else {
                        break;
                    };
                    forward_frame(ctx.pool, desc, src_mac, mac, tx, stats);
                    released += 1;
                    if !more {
                        break;
                    }
                }
                trace!("Released {} packets for {}", released, response.ip);
            }
            _ => {
                debug!("Dropping packets parked for unreachable {}", response.ip);
                for desc in self.pending.packets(root) {
                    self.stats().host_unreachable.inc();
                    self.notify_sender(
                        ctx,
                        desc,
                        IcmpType::DestinationUnreachable,
                        dest_unreachable::HOST_UNREACHABLE,
                    );
                    ctx.pool.free(desc);
                }
                let _ = self.pending.free_parent(root);
            }
        }
        true
    }

    fn notify_sender(
        &self,
        ctx: &mut RouterContext<'_>,
        desc: BufferDescriptor,
        icmp_type: IcmpType,
        code: u8,
    ) {
        let frame = ctx.pool.bytes(desc);
        if !may_report(frame) {
            return;
        }
        queue_icmp(
            ctx.icmp,
            self.interface,
            self.stats(),
            IcmpRequest::error(icmp_type, code, frame),
        );
    }

    fn send_redirect(&self, ctx: &mut RouterContext<'_>, desc: BufferDescriptor, gateway: Ipv4Addr) {
        let frame = ctx.pool.bytes(desc);
        if !may_report(frame) {
            return;
        }
        self.stats().icmp_redirects.inc();
        queue_icmp(
            ctx.icmp,
            self.interface,
            self.stats(),
            IcmpRequest::redirect(redirect::HOST, gateway, frame),
        );
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("interface", &self.interface)
            .field("routes", &self.routing.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// TTL, source and destination of an Ethernet/IPv4 frame
fn header_fields(frame: &[u8]) -> crate::Result<(u8, Ipv4Addr, Ipv4Addr)> {
    let eth = ethernet::Frame::parse(frame)?;
    let ip = Ipv4Header::parse(eth.payload())?;
    Ok((ip.ttl(), ip.src_addr(), ip.dst_addr()))
}

/// Rewrite addresses and TTL in place and queue the frame on `tx`.
fn forward_frame(
    pool: &mut BufferPool,
    desc: BufferDescriptor,
    src_mac: MacAddr,
    dst_mac: MacAddr,
    tx: &Producer<BufferDescriptor>,
    stats: &InterfaceStats,
) -> bool {
    let rewritten = FrameMut::parse(pool.bytes_mut(desc)).and_then(|mut frame| {
        frame.set_dst_mac(dst_mac);
        frame.set_src_mac(src_mac);
        let mut ip = Ipv4HeaderMut::parse(frame.payload_mut())?;
        Ok(ip.decrement_ttl())
    });

    if !matches!(rewritten, Ok(true)) {
        stats.ttl_expired.inc();
        pool.free(desc);
        return false;
    }

    if let Err(desc) = tx.enqueue(desc) {
        stats.tx_full.inc();
        tx.request_notification();
        pool.free(desc);
        return false;
    }
    stats.forwarded.inc();
    true
}

fn queue_icmp(
    icmp: &IcmpGenerator,
    interface: InterfaceId,
    stats: &InterfaceStats,
    request: crate::Result<IcmpRequest>,
) {
    match request {
        Ok(request) => {
            if icmp.enqueue(interface, request).is_err() {
                stats.icmp_dropped.inc();
            }
        }
        Err(e) => trace!("No ICMP for frame: {}", e),
    }
}

/// ICMP errors are never sent about ICMP errors (RFC 1122 3.2.2).
fn may_report(frame: &[u8]) -> bool {
    let Ok(eth) = ethernet::Frame::parse(frame) else {
        return false;
    };
    let Ok(ip) = Ipv4Header::parse(eth.payload()) else {
        return false;
    };
    if ip.protocol() != Protocol::Icmp as u8 {
        return true;
    }
    match ip.payload().first() {
        Some(&t) => IcmpType::from_u8(t).is_some_and(|t| !t.is_error()),
        None => false,
    }
}
