//! Routing table
//!
//! Bounded table of IPv4 routes with longest-prefix-match lookup and
//! recursive next-hop resolution.

use super::InterfaceId;
use crate::TableError;
use std::net::Ipv4Addr;
use tracing::trace;

/// Default bound on next-hop indirections per lookup
pub const DEFAULT_MAX_INDIRECTIONS: usize = 8;

/// Netmask for a prefix length (0..=32)
pub fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len.min(32))
    }
}

/// Route entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Outgoing interface
    pub interface: InterfaceId,
    /// Destination network, already masked
    pub network: Ipv4Addr,
    /// Network prefix length
    pub prefix_len: u8,
    /// Next hop (None for directly connected)
    pub next_hop: Option<Ipv4Addr>,
}

impl RouteEntry {
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & prefix_mask(self.prefix_len) == u32::from(self.network)
    }
}

/// Terminal result of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Interface to transmit on
    pub interface: InterfaceId,
    /// Address to resolve with ARP: the destination itself or the last
    /// gateway in the indirection chain
    pub ip: Ipv4Addr,
}

/// Routing table using longest prefix match
#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<RouteEntry>,
    capacity: usize,
    max_indirections: usize,
}

impl RoutingTable {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_indirections(capacity, DEFAULT_MAX_INDIRECTIONS)
    }

    pub fn with_max_indirections(capacity: usize, max_indirections: usize) -> Self {
        Self {
            routes: Vec::with_capacity(capacity),
            capacity,
            max_indirections,
        }
    }

    /// Add a route.
    ///
    /// A route with the same prefix length and network as an existing one is
    /// a `Duplicate` when interface and next hop also agree, and a `Clash`
    /// otherwise. The default route (prefix length 0) needs a next hop.
    pub fn add_route(
        &mut self,
        interface: InterfaceId,
        ip: Ipv4Addr,
        prefix_len: u8,
        next_hop: Option<Ipv4Addr>,
    ) -> Result<usize, TableError> {
        if prefix_len > 32 || (prefix_len == 0 && next_hop.is_none()) {
            return Err(TableError::InvalidRoute);
        }

        let network = Ipv4Addr::from(u32::from(ip) & prefix_mask(prefix_len));

        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.prefix_len == prefix_len && r.network == network)
        {
            return if existing.interface == interface && existing.next_hop == next_hop {
                Err(TableError::Duplicate)
            } else {
                Err(TableError::Clash)
            };
        }

        if self.routes.len() >= self.capacity {
            return Err(TableError::Full);
        }

        self.routes.push(RouteEntry {
            interface,
            network,
            prefix_len,
            next_hop,
        });
        Ok(self.routes.len() - 1)
    }

    /// Remove a route by index. Later routes shift down, keeping their order.
    pub fn remove_route(&mut self, route_id: usize) -> Result<RouteEntry, TableError> {
        if route_id >= self.routes.len() {
            return Err(TableError::InvalidId);
        }
        Ok(self.routes.remove(route_id))
    }

    /// Most specific route matching `addr`; the first one in table order
    /// wins among equally specific routes.
    fn longest_match(&self, addr: Ipv4Addr) -> Option<&RouteEntry> {
        let mut best: Option<&RouteEntry> = None;
        for route in &self.routes {
            if route.matches(addr) && best.map_or(true, |b| route.prefix_len > b.prefix_len) {
                best = Some(route);
            }
        }
        best
    }

    /// Resolve `addr` to an interface and the address to deliver to,
    /// following next hops at most `max_indirections` times.
    pub fn resolve(&self, addr: Ipv4Addr) -> Option<NextHop> {
        let mut ip = addr;

        for _ in 0..=self.max_indirections {
            let route = self.longest_match(ip)?;
            match route.next_hop {
                None => {
                    return Some(NextHop {
                        interface: route.interface,
                        ip,
                    })
                }
                Some(next_hop) => {
                    trace!(%ip, %next_hop, "route indirection");
                    ip = next_hop;
                }
            }
        }

        trace!(%addr, "route indirection limit reached");
        None
    }

    /// Outgoing interface for `addr`, None when there is no route.
    pub fn find_route(&self, addr: Ipv4Addr) -> Option<InterfaceId> {
        self.resolve(addr).map(|hop| hop.interface)
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_indirections(&self) -> usize {
        self.max_indirections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXT: InterfaceId = InterfaceId::External;
    const INT: InterfaceId = InterfaceId::Internal;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_worked_example() {
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(0, 0, 0, 0), 0, Some(ip(10, 0, 0, 1))).unwrap();
        table.add_route(INT, ip(192, 168, 1, 0), 24, None).unwrap();

        assert_eq!(table.find_route(ip(192, 168, 1, 5)), Some(INT));
        // 8.8.8.8 -> default -> 10.0.0.1 -> default -> ... never terminates
        assert_eq!(table.find_route(ip(8, 8, 8, 8)), None);
    }

    #[test]
    fn test_default_route_resolves_through_connected_gateway() {
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(0, 0, 0, 0), 0, Some(ip(10, 0, 0, 1))).unwrap();
        table.add_route(EXT, ip(10, 0, 0, 0), 8, None).unwrap();

        assert_eq!(
            table.resolve(ip(8, 8, 8, 8)),
            Some(NextHop {
                interface: EXT,
                ip: ip(10, 0, 0, 1)
            })
        );
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut table = RoutingTable::new(8);
        table.add_route(EXT, ip(10, 0, 0, 0), 8, None).unwrap();
        table.add_route(INT, ip(10, 1, 0, 0), 16, None).unwrap();
        table.add_route(EXT, ip(10, 1, 2, 0), 24, None).unwrap();

        assert_eq!(table.find_route(ip(10, 9, 9, 9)), Some(EXT));
        assert_eq!(table.find_route(ip(10, 1, 9, 9)), Some(INT));
        assert_eq!(table.find_route(ip(10, 1, 2, 9)), Some(EXT));
        assert_eq!(table.find_route(ip(11, 0, 0, 1)), None);
    }

    #[test]
    fn test_longest_prefix_match_independent_of_insertion_order() {
        let mut table = RoutingTable::new(8);
        table.add_route(EXT, ip(10, 1, 2, 0), 24, None).unwrap();
        table.add_route(INT, ip(10, 0, 0, 0), 8, None).unwrap();

        assert_eq!(table.find_route(ip(10, 1, 2, 3)), Some(EXT));
        assert_eq!(table.find_route(ip(10, 1, 3, 3)), Some(INT));
    }

    #[test]
    fn test_host_route() {
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(192, 168, 0, 0), 16, None).unwrap();
        table.add_route(INT, ip(192, 168, 7, 7), 32, None).unwrap();

        assert_eq!(table.find_route(ip(192, 168, 7, 7)), Some(INT));
        assert_eq!(table.find_route(ip(192, 168, 7, 8)), Some(EXT));
    }

    #[test]
    fn test_default_route_requires_next_hop() {
        let mut table = RoutingTable::new(4);
        assert_eq!(
            table.add_route(EXT, ip(0, 0, 0, 0), 0, None),
            Err(TableError::InvalidRoute)
        );
        assert_eq!(
            table.add_route(EXT, ip(10, 0, 0, 0), 33, None),
            Err(TableError::InvalidRoute)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_and_clash() {
        let mut table = RoutingTable::new(4);
        table.add_route(INT, ip(192, 168, 1, 0), 24, None).unwrap();

        // Same network written with host bits set is still the same network
        assert_eq!(
            table.add_route(INT, ip(192, 168, 1, 77), 24, None),
            Err(TableError::Duplicate)
        );
        assert_eq!(
            table.add_route(EXT, ip(192, 168, 1, 0), 24, None),
            Err(TableError::Clash)
        );
        assert_eq!(
            table.add_route(INT, ip(192, 168, 1, 0), 24, Some(ip(10, 0, 0, 1))),
            Err(TableError::Clash)
        );
        // Different prefix length overlaps without clashing
        assert!(table.add_route(EXT, ip(192, 168, 0, 0), 16, None).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full() {
        let mut table = RoutingTable::new(2);
        table.add_route(EXT, ip(10, 0, 0, 0), 8, None).unwrap();
        table.add_route(EXT, ip(11, 0, 0, 0), 8, None).unwrap();
        assert_eq!(
            table.add_route(EXT, ip(12, 0, 0, 0), 8, None),
            Err(TableError::Full)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(10, 0, 0, 0), 8, None).unwrap();
        table.add_route(INT, ip(11, 0, 0, 0), 8, None).unwrap();
        table.add_route(EXT, ip(12, 0, 0, 0), 8, None).unwrap();

        let removed = table.remove_route(0).unwrap();
        assert_eq!(removed.network, ip(10, 0, 0, 0));
        assert_eq!(table.routes()[0].network, ip(11, 0, 0, 0));
        assert_eq!(table.routes()[1].network, ip(12, 0, 0, 0));

        assert_eq!(table.remove_route(2), Err(TableError::InvalidId));
        assert_eq!(table.find_route(ip(10, 1, 1, 1)), None);
    }

    #[test]
    fn test_recursive_resolution_within_bound() {
        // 1.0.0.0/8 -> 2.0.0.1 -> 3.0.0.1 -> 4.0.0.1 (connected)
        let mut table = RoutingTable::with_max_indirections(8, 3);
        table.add_route(EXT, ip(1, 0, 0, 0), 8, Some(ip(2, 0, 0, 1))).unwrap();
        table.add_route(EXT, ip(2, 0, 0, 0), 8, Some(ip(3, 0, 0, 1))).unwrap();
        table.add_route(EXT, ip(3, 0, 0, 0), 8, Some(ip(4, 0, 0, 1))).unwrap();
        table.add_route(INT, ip(4, 0, 0, 0), 8, None).unwrap();

        assert_eq!(
            table.resolve(ip(1, 2, 3, 4)),
            Some(NextHop {
                interface: INT,
                ip: ip(4, 0, 0, 1)
            })
        );

        // One more hop than allowed
        let mut short = RoutingTable::with_max_indirections(8, 2);
        for route in table.routes() {
            short
                .add_route(route.interface, route.network, route.prefix_len, route.next_hop)
                .unwrap();
        }
        assert_eq!(short.find_route(ip(1, 2, 3, 4)), None);
        assert_eq!(short.find_route(ip(2, 2, 3, 4)), Some(INT));
    }

    #[test]
    fn test_cycle_returns_no_route() {
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(10, 0, 0, 0), 8, Some(ip(20, 0, 0, 1))).unwrap();
        table.add_route(EXT, ip(20, 0, 0, 0), 8, Some(ip(10, 0, 0, 1))).unwrap();

        assert_eq!(table.find_route(ip(10, 5, 5, 5)), None);
    }

    #[test]
    fn test_tie_break_keeps_first_installed() {
        // Two equally long prefixes can only both match when they name the
        // same network, and the second one is refused at insertion. The
        // entry installed first is the one lookups return.
        let mut table = RoutingTable::new(4);
        table.add_route(EXT, ip(10, 0, 0, 0), 16, None).unwrap();
        assert_eq!(
            table.add_route(INT, ip(10, 0, 9, 9), 16, None),
            Err(TableError::Clash)
        );

        assert_eq!(table.find_route(ip(10, 0, 1, 1)), Some(EXT));
    }
}
