//! ARP cache (IP to MAC mapping)
//!
//! Fixed array of slots scanned linearly. A slot is free while its state is
//! `Invalid`; nothing is evicted implicitly.

use crate::protocol::MacAddr;
use crate::TableError;
use std::net::Ipv4Addr;

/// ARP entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArpState {
    /// Free slot
    #[default]
    Invalid,
    /// Request sent, waiting for a reply
    Pending,
    /// Retries exhausted without a reply
    Unreachable,
    /// MAC address known
    Reachable,
}

/// Identifies a component that asked for a resolution
pub type ClientId = u8;

/// Set of clients waiting on one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientMask(u64);

impl ClientMask {
    /// Highest number of distinct clients
    pub const MAX_CLIENTS: usize = 64;

    pub fn single(client: ClientId) -> Self {
        let mut mask = Self::default();
        mask.insert(client);
        mask
    }

    pub fn insert(&mut self, client: ClientId) {
        debug_assert!((client as usize) < Self::MAX_CLIENTS);
        self.0 |= 1u64 << (client as u64 % 64);
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.0 & (1u64 << (client as u64 % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Clients in ascending order
    pub fn iter(&self) -> impl Iterator<Item = ClientId> {
        let bits = self.0;
        (0..Self::MAX_CLIENTS as u8).filter(move |c| bits & (1u64 << *c) != 0)
    }
}

/// ARP cache entry
#[derive(Debug, Clone, Copy)]
pub struct ArpEntry {
    pub state: ArpState,
    pub ip: Ipv4Addr,
    /// Only meaningful when `state` is `Reachable`
    pub mac: MacAddr,
    pub clients: ClientMask,
    pub retries: u8,
}

impl Default for ArpEntry {
    fn default() -> Self {
        Self {
            state: ArpState::Invalid,
            ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddr::ZERO,
            clients: ClientMask::default(),
            retries: 0,
        }
    }
}

/// Resolution result handed to components that do not read the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpResponse {
    pub ip: Ipv4Addr,
    pub state: ArpState,
    /// Set only when `state` is `Reachable`
    pub mac: Option<MacAddr>,
}

/// ARP cache with a fixed number of slots
#[derive(Debug)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![ArpEntry::default(); capacity],
        }
    }

    /// Find the live entry for `ip`
    pub fn find_entry(&self, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries
            .iter()
            .find(|e| e.state != ArpState::Invalid && e.ip == ip)
    }

    pub fn find_entry_mut(&mut self, ip: Ipv4Addr) -> Option<&mut ArpEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.state != ArpState::Invalid && e.ip == ip)
    }

    /// Insert or overwrite the entry for `ip`.
    ///
    /// The existing slot for `ip` is reused if there is one, otherwise the
    /// first free slot. `client` is added to the entry's waiters and the
    /// retry count restarts.
    pub fn add_entry(
        &mut self,
        state: ArpState,
        ip: Ipv4Addr,
        mac: Option<MacAddr>,
        client: ClientId,
    ) -> Result<&ArpEntry, TableError> {
        let mac = match (state, mac) {
            (ArpState::Invalid, _) | (ArpState::Reachable, None) => {
                return Err(TableError::InvalidArp)
            }
            (ArpState::Reachable, Some(mac)) => mac,
            _ => MacAddr::ZERO,
        };

        let slot = match self
            .entries
            .iter()
            .position(|e| e.state != ArpState::Invalid && e.ip == ip)
        {
            Some(index) => index,
            None => self
                .entries
                .iter()
                .position(|e| e.state == ArpState::Invalid)
                .ok_or(TableError::Full)?,
        };

        let entry = &mut self.entries[slot];
        if entry.state == ArpState::Invalid {
            entry.clients = ClientMask::default();
        }
        entry.state = state;
        entry.ip = ip;
        entry.mac = mac;
        entry.clients.insert(client);
        entry.retries = 0;

        Ok(entry)
    }

    /// Outward view of an entry
    pub fn response_from_entry(entry: &ArpEntry) -> ArpResponse {
        ArpResponse {
            ip: entry.ip,
            state: entry.state,
            mac: (entry.state == ArpState::Reachable).then_some(entry.mac),
        }
    }

    /// Live entries
    pub fn entries(&self) -> impl Iterator<Item = &ArpEntry> {
        self.entries.iter().filter(|e| e.state != ArpState::Invalid)
    }

    /// Every slot, free ones included, in slot order
    pub(crate) fn slots_mut(&mut self) -> &mut [ArpEntry] {
        &mut self.entries
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn test_pending_then_reachable_reuses_slot() {
        let mut cache = ArpCache::new(4);
        let ip = Ipv4Addr::new(192, 168, 1, 1);

        cache.add_entry(ArpState::Pending, ip, None, 0).unwrap();
        assert_eq!(cache.find_entry(ip).unwrap().state, ArpState::Pending);

        let entry = cache.add_entry(ArpState::Reachable, ip, Some(MAC), 1).unwrap();
        assert_eq!(entry.state, ArpState::Reachable);
        assert_eq!(entry.mac, MAC);
        assert!(entry.clients.contains(0));
        assert!(entry.clients.contains(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reachable_requires_mac() {
        let mut cache = ArpCache::new(1);
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(
            cache.add_entry(ArpState::Reachable, ip, None, 0).err(),
            Some(TableError::InvalidArp)
        );
        assert_eq!(
            cache.add_entry(ArpState::Invalid, ip, None, 0).err(),
            Some(TableError::InvalidArp)
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_full() {
        let mut cache = ArpCache::new(2);
        cache
            .add_entry(ArpState::Pending, Ipv4Addr::new(10, 0, 0, 1), None, 0)
            .unwrap();
        cache
            .add_entry(ArpState::Pending, Ipv4Addr::new(10, 0, 0, 2), None, 0)
            .unwrap();
        assert_eq!(
            cache
                .add_entry(ArpState::Pending, Ipv4Addr::new(10, 0, 0, 3), None, 0)
                .err(),
            Some(TableError::Full)
        );

        // Overwriting an existing IP still works when full
        assert!(cache
            .add_entry(ArpState::Reachable, Ipv4Addr::new(10, 0, 0, 2), Some(MAC), 0)
            .is_ok());
    }

    #[test]
    fn test_find_ignores_invalid_slots() {
        let cache = ArpCache::new(4);
        // Free slots hold 0.0.0.0 but must not match it
        assert!(cache.find_entry(Ipv4Addr::UNSPECIFIED).is_none());
    }

    #[test]
    fn test_add_resets_retries() {
        let mut cache = ArpCache::new(2);
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        cache.add_entry(ArpState::Pending, ip, None, 0).unwrap();
        cache.find_entry_mut(ip).unwrap().retries = 3;

        cache.add_entry(ArpState::Pending, ip, None, 0).unwrap();
        assert_eq!(cache.find_entry(ip).unwrap().retries, 0);
    }

    #[test]
    fn test_response_from_entry() {
        let mut cache = ArpCache::new(2);
        let ip = Ipv4Addr::new(10, 0, 0, 1);

        let entry = cache.add_entry(ArpState::Pending, ip, None, 0).unwrap();
        let response = ArpCache::response_from_entry(entry);
        assert_eq!(response.state, ArpState::Pending);
        assert_eq!(response.mac, None);

        let entry = cache.add_entry(ArpState::Reachable, ip, Some(MAC), 0).unwrap();
        let response = ArpCache::response_from_entry(entry);
        assert_eq!(
            response,
            ArpResponse {
                ip,
                state: ArpState::Reachable,
                mac: Some(MAC),
            }
        );
    }

    #[test]
    fn test_client_mask() {
        let mut mask = ClientMask::default();
        assert!(mask.is_empty());
        mask.insert(3);
        mask.insert(0);
        mask.insert(63);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3, 63]);
        assert!(!mask.contains(1));
    }
}
