//! Configuration types

use crate::dataplane::InterfaceId;
use crate::protocol::MacAddr;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Configuration file (twinwall.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub interfaces: Interfaces,
}

impl Config {
    pub fn interface(&self, id: InterfaceId) -> &InterfaceConfig {
        match id {
            InterfaceId::External => &self.interfaces.external,
            InterfaceId::Internal => &self.interfaces.internal,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Fixed capacities; nothing grows past these at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Packet buffers in the shared pool
    pub buffers: usize,
    /// Bytes per packet buffer
    pub buffer_size: usize,
    /// Routes per routing table
    pub routes: usize,
    /// Recursive next-hop lookups before giving up
    pub max_indirections: usize,
    /// ARP cache slots per interface
    pub arp_entries: usize,
    /// ARP retries before a next hop is declared unreachable
    pub arp_max_retries: u8,
    /// ARP retry timer period
    pub arp_tick_ms: u64,
    /// Parked packets per router
    pub pending_packets: usize,
    /// Queued ICMP messages per interface
    pub icmp_queue: usize,
    /// Slots in every inter-stage ring
    pub ring_capacity: usize,
    /// Items a stage handles per pass
    pub batch: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            buffers: 1024,
            buffer_size: crate::dataplane::DEFAULT_BUFFER_SIZE,
            routes: 64,
            max_indirections: crate::dataplane::DEFAULT_MAX_INDIRECTIONS,
            arp_entries: 256,
            arp_max_retries: 5,
            arp_tick_ms: 1000,
            pending_packets: 512,
            icmp_queue: 64,
            ring_capacity: 256,
            batch: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Interfaces {
    pub external: InterfaceConfig,
    pub internal: InterfaceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceConfig {
    /// Kernel device to bind (e.g. "eth0"); not needed for offline commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub mac: MacAddr,
    /// Interface address in CIDR form
    pub address: String,
    /// Routes used for packets arriving on this interface
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Source NAT for packets arriving on this interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatConfig>,
}

impl InterfaceConfig {
    /// Parsed `address`
    pub fn cidr(&self) -> Result<(Ipv4Addr, u8)> {
        parse_cidr(&self.address)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Destination network in CIDR form
    pub destination: String,
    /// Egress interface
    pub interface: InterfaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl RouteConfig {
    pub fn cidr(&self) -> Result<(Ipv4Addr, u8)> {
        parse_cidr(&self.destination)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct NatConfig {
    /// Address written into translated packets
    pub address: Ipv4Addr,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_nat_capacity")]
    pub capacity: usize,
}

fn default_base_port() -> u16 {
    40000
}

fn default_nat_capacity() -> usize {
    1024
}

/// Parse "a.b.c.d/len"
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| Error::Parse(format!("'{}' is missing a prefix length", s)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Parse(format!("invalid IPv4 address in '{}'", s)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::Parse(format!("invalid prefix length in '{}'", s)))?;
    if len > 32 {
        return Err(Error::Parse(format!("prefix length {} exceeds 32", len)));
    }
    Ok((addr, len))
}
