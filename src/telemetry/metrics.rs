//! Metrics collection for packet statistics.
//!
//! Provides thread-safe counters for tracking forwarding outcomes per
//! interface. Components hold an `Arc<MetricsRegistry>` and bump counters
//! from the hot path; readers call [`MetricsRegistry::export`].

use crate::dataplane::InterfaceId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge holding the last reported value.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: usize) {
        self.0.store(val as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface statistics. Drops are attributed to the ingress interface.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    /// Number of frames received.
    pub rx_packets: Counter,
    /// Number of bytes received.
    pub rx_bytes: Counter,
    /// Number of frames transmitted.
    pub tx_packets: Counter,
    /// Number of bytes transmitted.
    pub tx_bytes: Counter,
    /// Frames dropped at receive (no buffer, rx ring full, malformed).
    pub rx_drops: Counter,
    /// Transmit errors reported by the device.
    pub tx_errors: Counter,

    /// Packets handed to an egress ring.
    pub forwarded: Counter,
    /// Packets parked waiting for ARP.
    pub parked: Counter,
    /// No route to the destination.
    pub no_route: Counter,
    /// TTL expired in transit.
    pub ttl_expired: Counter,
    /// Next hop did not answer ARP.
    pub host_unreachable: Counter,
    /// Pending arena was full.
    pub pending_full: Counter,
    /// Egress ring was full.
    pub tx_full: Counter,

    /// Packets rewritten by NAT (either direction).
    pub nat_translated: Counter,
    /// NAT port tables exhausted.
    pub nat_exhausted: Counter,
    /// Return traffic for the NAT address without a mapping.
    pub nat_no_mapping: Counter,

    /// ICMP messages transmitted.
    pub icmp_sent: Counter,
    /// ICMP requests lost to a full queue.
    pub icmp_dropped: Counter,
    /// ICMP redirects queued.
    pub icmp_redirects: Counter,

    /// ARP requests transmitted (including retries).
    pub arp_requests_sent: Counter,
    /// ARP replies transmitted.
    pub arp_replies_sent: Counter,
}

impl InterfaceStats {
    /// Creates new interface statistics initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received frame.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    /// Records a transmitted frame.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    fn export(&self, prefix: &str, out: &mut Vec<(String, u64)>) {
        let counters: [(&str, &Counter); 21] = [
            ("rx_packets", &self.rx_packets),
            ("rx_bytes", &self.rx_bytes),
            ("tx_packets", &self.tx_packets),
            ("tx_bytes", &self.tx_bytes),
            ("rx_drops", &self.rx_drops),
            ("tx_errors", &self.tx_errors),
            ("forwarded", &self.forwarded),
            ("parked", &self.parked),
            ("no_route", &self.no_route),
            ("ttl_expired", &self.ttl_expired),
            ("host_unreachable", &self.host_unreachable),
            ("pending_full", &self.pending_full),
            ("tx_full", &self.tx_full),
            ("nat_translated", &self.nat_translated),
            ("nat_exhausted", &self.nat_exhausted),
            ("nat_no_mapping", &self.nat_no_mapping),
            ("icmp_sent", &self.icmp_sent),
            ("icmp_dropped", &self.icmp_dropped),
            ("icmp_redirects", &self.icmp_redirects),
            ("arp_requests_sent", &self.arp_requests_sent),
            ("arp_replies_sent", &self.arp_replies_sent),
        ];
        out.extend(
            counters
                .iter()
                .map(|(name, c)| (format!("{}_{}", prefix, name), c.get())),
        );
    }
}

/// Metrics for one firewall instance.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    interfaces: [InterfaceStats; 2],

    /// Live ARP entries across both caches.
    pub arp_entries: Gauge,
    /// Packets currently parked across both routers.
    pub pending_packets: Gauge,
    /// NAT mappings allocated across all translators.
    pub nat_mappings: Gauge,
    /// Installed routes across both routers.
    pub route_count: Gauge,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics for one interface.
    pub fn interface(&self, interface: InterfaceId) -> &InterfaceStats {
        &self.interfaces[interface.index()]
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("arp_entries".into(), self.arp_entries.get()),
            ("pending_packets".into(), self.pending_packets.get()),
            ("nat_mappings".into(), self.nat_mappings.get()),
            ("route_count".into(), self.route_count.get()),
        ];

        for interface in InterfaceId::ALL {
            self.interface(interface)
                .export(interface.as_str(), &mut result);
        }

        result
    }
}
