//! Data plane components
//!
//! Handles packet processing for the two interfaces: classification, NAT,
//! routing, ARP resolution and ICMP generation. Stages are connected by
//! fixed-capacity SPSC rings and share one buffer pool.

mod arp_cache;
mod arp_processor;
mod buffer;
mod firewall;
mod icmp_generator;
mod interface;
mod napt;
mod notify;
mod pending;
pub mod ring;
mod router;
mod routing;

pub use arp_cache::{ArpCache, ArpEntry, ArpResponse, ArpState, ClientId, ClientMask};
pub use arp_processor::{ArpClient, ArpRequester, ArpResponder};
pub use buffer::{BufferDescriptor, BufferPool, DEFAULT_BUFFER_SIZE};
pub use firewall::Firewall;
pub use icmp_generator::{IcmpGenerator, IcmpRequest, ECHO_PAYLOAD_MAX};
pub use interface::{InterfaceId, InterfaceInfo};
pub use napt::{NatInterface, NatOutcome, NatPortMapping, NatPortTable, NatProtocol, NatTranslator};
pub use notify::{CountingNotify, FnNotify, NoopNotify, Notify};
pub use pending::{NodeId, PendingPacketQueue};
pub use router::{ForwardAction, Router, RouterContext};
pub use routing::{prefix_mask, NextHop, RouteEntry, RoutingTable, DEFAULT_MAX_INDIRECTIONS};
