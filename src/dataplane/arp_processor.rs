//! ARP packet processing
//!
//! [`ArpResponder`] answers requests for the interface address.
//! [`ArpRequester`] owns the interface's [`ArpCache`] and resolves addresses
//! on behalf of client components, which talk to it over a pair of rings
//! (requests in, responses out). Retries are counted by [`ArpRequester::tick`],
//! driven by an external timer.

use super::arp_cache::{ArpCache, ArpResponse, ArpState, ClientId, ClientMask};
use super::buffer::{BufferDescriptor, BufferPool};
use super::interface::{InterfaceId, InterfaceInfo};
use super::ring::{self, Consumer, Producer};
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::telemetry::MetricsRegistry;
use crate::TableError;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Write `packet` as a frame into a fresh buffer and queue it on `tx`.
///
/// Returns false when no buffer or ring slot is available; a notification is
/// requested on `tx` in that case.
fn transmit(packet: &ArpPacket, pool: &mut BufferPool, tx: &Producer<BufferDescriptor>) -> bool {
    if tx.is_full() {
        tx.request_notification();
        return false;
    }
    let Some(mut desc) = pool.alloc() else {
        tx.request_notification();
        return false;
    };

    match packet.write_frame(pool.slot_mut(desc)) {
        Ok(len) => desc.len = len,
        Err(e) => {
            debug!("Failed to build ARP frame: {}", e);
            pool.free(desc);
            return false;
        }
    }

    if let Err(desc) = tx.enqueue(desc) {
        pool.free(desc);
        tx.request_notification();
        return false;
    }
    true
}

/// Answers ARP requests addressed to the interface
#[derive(Debug)]
pub struct ArpResponder {
    interface: InterfaceId,
    info: InterfaceInfo,
    metrics: Arc<MetricsRegistry>,
}

impl ArpResponder {
    pub fn new(interface: InterfaceId, info: InterfaceInfo, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            interface,
            info,
            metrics,
        }
    }

    /// Reply to build for `packet`, if it is a request for our address
    pub fn reply_for(&self, packet: &ArpPacket) -> Option<ArpPacket> {
        if packet.operation != ArpOp::Request || packet.target_ip != self.info.ip_addr {
            return None;
        }
        Some(ArpPacket::reply(
            self.info.mac_addr,
            self.info.ip_addr,
            packet.sender_mac,
            packet.sender_ip,
        ))
    }

    /// Answer `packet` on `tx`. Returns true if a reply was queued.
    pub fn process(
        &self,
        packet: &ArpPacket,
        pool: &mut BufferPool,
        tx: &Producer<BufferDescriptor>,
    ) -> bool {
        let Some(reply) = self.reply_for(packet) else {
            return false;
        };

        if transmit(&reply, pool, tx) {
            trace!(
                "ARP reply to {} ({}) on {}",
                packet.sender_ip,
                packet.sender_mac,
                self.interface
            );
            self.metrics.interface(self.interface).arp_replies_sent.inc();
            true
        } else {
            debug!(
                "No room to answer ARP request from {} on {}",
                packet.sender_ip, self.interface
            );
            false
        }
    }
}

/// Client side of a requester connection
pub struct ArpClient {
    pub id: ClientId,
    pub requests: Producer<Ipv4Addr>,
    pub responses: Consumer<ArpResponse>,
}

struct ClientLink {
    requests: Consumer<Ipv4Addr>,
    responses: Producer<ArpResponse>,
}

/// Resolves next-hop addresses on one interface
pub struct ArpRequester {
    interface: InterfaceId,
    info: InterfaceInfo,
    cache: ArpCache,
    max_retries: u8,
    clients: Vec<ClientLink>,
    metrics: Arc<MetricsRegistry>,
}

impl ArpRequester {
    pub fn new(
        interface: InterfaceId,
        info: InterfaceInfo,
        cache_capacity: usize,
        max_retries: u8,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            interface,
            info,
            cache: ArpCache::new(cache_capacity),
            max_retries,
            clients: Vec::new(),
            metrics,
        }
    }

    /// Connect a new client, returning its ends of the request and response
    /// rings.
    pub fn connect(&mut self, ring_capacity: usize) -> Result<ArpClient, TableError> {
        if self.clients.len() >= ClientMask::MAX_CLIENTS {
            return Err(TableError::Full);
        }
        let id = self.clients.len() as ClientId;
        let (request_tx, request_rx) = ring::channel(ring_capacity);
        let (response_tx, response_rx) = ring::channel(ring_capacity);
        self.clients.push(ClientLink {
            requests: request_rx,
            responses: response_tx,
        });

        Ok(ArpClient {
            id,
            requests: request_tx,
            responses: response_rx,
        })
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    /// Mutable cache access, for static entries
    pub fn cache_mut(&mut self) -> &mut ArpCache {
        &mut self.cache
    }

    /// Drain up to `budget` queued requests from every client.
    pub fn process(
        &mut self,
        budget: usize,
        pool: &mut BufferPool,
        tx: &Producer<BufferDescriptor>,
    ) -> usize {
        let mut handled = 0;
        for client in 0..self.clients.len() {
            for _ in 0..budget {
                let Some(ip) = self.clients[client].requests.dequeue() else {
                    break;
                };
                self.request(client as ClientId, ip, pool, tx);
                handled += 1;
            }
        }
        handled
    }

    /// Resolve `ip` for `client`.
    ///
    /// Known outcomes are answered at once. A pending entry just gains the
    /// client. Unknown addresses get a pending entry and a broadcast request;
    /// if the cache is full the client is told the address is unreachable.
    pub fn request(
        &mut self,
        client: ClientId,
        ip: Ipv4Addr,
        pool: &mut BufferPool,
        tx: &Producer<BufferDescriptor>,
    ) {
        if let Some(entry) = self.cache.find_entry_mut(ip) {
            match entry.state {
                ArpState::Reachable | ArpState::Unreachable => {
                    let response = ArpCache::response_from_entry(entry);
                    self.respond(ClientMask::single(client), response);
                }
                ArpState::Pending => entry.clients.insert(client),
                ArpState::Invalid => {}
            }
            return;
        }

        match self.cache.add_entry(ArpState::Pending, ip, None, client) {
            Ok(_) => {
                debug!("Resolving {} on {}", ip, self.interface);
                self.send_request(ip, pool, tx);
            }
            Err(e) => {
                warn!("ARP cache on {} cannot track {}: {}", self.interface, ip, e);
                self.respond(
                    ClientMask::single(client),
                    ArpResponse {
                        ip,
                        state: ArpState::Unreachable,
                        mac: None,
                    },
                );
            }
        }
    }

    /// Handle an ARP reply received on the interface. Only pending entries
    /// are promoted; unsolicited replies are ignored.
    pub fn process_reply(&mut self, packet: &ArpPacket) -> bool {
        if packet.operation != ArpOp::Reply {
            return false;
        }
        let Some(entry) = self.cache.find_entry_mut(packet.sender_ip) else {
            trace!("Unsolicited ARP reply from {}", packet.sender_ip);
            return false;
        };
        if entry.state != ArpState::Pending {
            return false;
        }

        entry.state = ArpState::Reachable;
        entry.mac = packet.sender_mac;
        entry.retries = 0;
        let clients = std::mem::take(&mut entry.clients);
        let response = ArpCache::response_from_entry(entry);

        info!(
            "Resolved {} -> {} on {}",
            packet.sender_ip, packet.sender_mac, self.interface
        );
        self.respond(clients, response);
        true
    }

    /// Retry timer. Pending entries are re-requested until `max_retries`,
    /// then marked unreachable and their clients told. Responses that could
    /// not be delivered earlier are retried.
    pub fn tick(&mut self, pool: &mut BufferPool, tx: &Producer<BufferDescriptor>) {
        for index in 0..self.cache.capacity() {
            let entry = &mut self.cache.slots_mut()[index];
            match entry.state {
                ArpState::Pending if entry.retries >= self.max_retries => {
                    entry.state = ArpState::Unreachable;
                    let clients = std::mem::take(&mut entry.clients);
                    let response = ArpCache::response_from_entry(entry);
                    warn!("No ARP reply from {} on {}", response.ip, self.interface);
                    self.respond(clients, response);
                }
                ArpState::Pending => {
                    entry.retries += 1;
                    let ip = entry.ip;
                    trace!("ARP retry {} for {} on {}", entry.retries, ip, self.interface);
                    self.send_request(ip, pool, tx);
                }
                ArpState::Reachable | ArpState::Unreachable if !entry.clients.is_empty() => {
                    let clients = std::mem::take(&mut entry.clients);
                    let response = ArpCache::response_from_entry(entry);
                    self.respond(clients, response);
                }
                _ => {}
            }
        }
    }

    fn send_request(&self, ip: Ipv4Addr, pool: &mut BufferPool, tx: &Producer<BufferDescriptor>) {
        let request = ArpPacket::request(self.info.mac_addr, self.info.ip_addr, ip);
        if transmit(&request, pool, tx) {
            self.metrics
                .interface(self.interface)
                .arp_requests_sent
                .inc();
        } else {
            // The entry stays pending; the next tick retries.
            debug!("No room for ARP request for {} on {}", ip, self.interface);
        }
    }

    /// Deliver `response` to every client in `clients`. Clients whose ring
    /// is full keep their bit on the entry so `tick` can try again.
    fn respond(&mut self, clients: ClientMask, response: ArpResponse) {
        let mut undelivered = ClientMask::default();
        for client in clients.iter() {
            let Some(link) = self.clients.get(client as usize) else {
                continue;
            };
            if link.responses.enqueue(response).is_err() {
                undelivered.insert(client);
            }
        }

        if undelivered.is_empty() {
            return;
        }
        debug!(
            "ARP response for {} delayed, client ring full on {}",
            response.ip, self.interface
        );
        if let Some(entry) = self.cache.find_entry_mut(response.ip) {
            for client in undelivered.iter() {
                entry.clients.insert(client);
            }
        }
    }
}

impl std::fmt::Debug for ArpRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArpRequester")
            .field("interface", &self.interface)
            .field("cache", &self.cache)
            .field("max_retries", &self.max_retries)
            .field("clients", &self.clients.len())
            .finish()
    }
}
