//! Configuration validation

use super::{parse_cidr, Config, InterfaceConfig};
use crate::dataplane::InterfaceId;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    for id in InterfaceId::ALL {
        validate_interface(id, config.interface(id), &mut result);
    }
    validate_nat(config, &mut result);

    result
}

fn validate_limits(config: &Config, result: &mut ValidationResult) {
    let limits = &config.limits;
    let nonzero = [
        ("buffers", limits.buffers),
        ("routes", limits.routes),
        ("arp_entries", limits.arp_entries),
        ("pending_packets", limits.pending_packets),
        ("icmp_queue", limits.icmp_queue),
        ("ring_capacity", limits.ring_capacity),
        ("batch", limits.batch),
    ];
    for (name, value) in nonzero {
        if value == 0 {
            result.error(format!("limits.{}: must be greater than zero", name));
        }
    }

    // Full Ethernet frame without FCS
    if limits.buffer_size < 1514 {
        result.error(format!(
            "limits.buffer_size: {} cannot hold a full Ethernet frame (1514)",
            limits.buffer_size
        ));
    }

    if limits.arp_tick_ms == 0 {
        result.error("limits.arp_tick_ms: must be greater than zero");
    }

    if limits.arp_max_retries == 0 {
        result.warn("limits.arp_max_retries: 0, next hops fail on the first timer tick");
    }

    let routes_needed = 2 + config
        .interfaces
        .external
        .routes
        .len()
        .max(config.interfaces.internal.routes.len());
    if routes_needed > limits.routes {
        result.error(format!(
            "limits.routes: {} is too small for {} routes (including connected)",
            limits.routes, routes_needed
        ));
    }
}

fn validate_interface(id: InterfaceId, iface: &InterfaceConfig, result: &mut ValidationResult) {
    if !iface.mac.is_unicast() {
        result.error(format!(
            "interfaces.{}: mac {} is not a unicast address",
            id, iface.mac
        ));
    }

    if let Err(e) = parse_cidr(&iface.address) {
        result.error(format!("interfaces.{}.address: {}", id, e));
    }

    if iface.device.is_none() {
        result.warn(format!(
            "interfaces.{}: no device configured, `run` will fail",
            id
        ));
    }

    for (i, route) in iface.routes.iter().enumerate() {
        match route.cidr() {
            Ok((_, 0)) if route.gateway.is_none() => {
                result.error(format!(
                    "interfaces.{}.routes[{}]: default route requires a gateway",
                    id, i
                ));
            }
            Ok(_) => {}
            Err(e) => {
                result.error(format!("interfaces.{}.routes[{}]: {}", id, i, e));
            }
        }
    }
}

fn validate_nat(config: &Config, result: &mut ValidationResult) {
    for id in InterfaceId::ALL {
        let Some(nat) = &config.interface(id).nat else {
            continue;
        };

        if nat.capacity == 0 {
            result.error(format!("interfaces.{}.nat.capacity: must be greater than zero", id));
        }
        if nat.base_port as usize + nat.capacity > u16::MAX as usize + 1 {
            result.error(format!(
                "interfaces.{}.nat: {} ports from {} exceed the port space",
                id, nat.capacity, nat.base_port
            ));
        }
        if nat.base_port < 1024 {
            result.warn(format!(
                "interfaces.{}.nat.base_port: {} overlaps well-known ports",
                id, nat.base_port
            ));
        }

        // Return traffic is addressed to the NAT IP and arrives on the mirror
        let mirror = config.interface(id.mirror());
        if let Ok((mirror_ip, _)) = parse_cidr(&mirror.address) {
            if mirror_ip != nat.address {
                result.warn(format!(
                    "interfaces.{}.nat.address: {} is not the {} address ({}), replies must be routed to it",
                    id,
                    nat.address,
                    id.mirror(),
                    mirror_ip
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interfaces, LimitsConfig, LoggingConfig, NatConfig, RouteConfig};
    use crate::protocol::MacAddr;
    use std::net::Ipv4Addr;

    fn make_interface(last: u8, address: &str) -> InterfaceConfig {
        InterfaceConfig {
            device: Some(format!("eth{}", last)),
            mac: MacAddr([0x02, 0, 0, 0, 0, last]),
            address: address.to_string(),
            routes: Vec::new(),
            nat: None,
        }
    }

    fn make_config() -> Config {
        Config {
            logging: LoggingConfig::default(),
            limits: LimitsConfig::default(),
            interfaces: Interfaces {
                external: make_interface(1, "203.0.113.1/24"),
                internal: make_interface(2, "192.168.1.1/24"),
            },
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = make_config();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_invalid_address() {
        let mut config = make_config();
        config.interfaces.internal.address = "192.168.1.1".to_string();
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("interfaces.internal.address")));
    }

    #[test]
    fn test_multicast_mac_rejected() {
        let mut config = make_config();
        config.interfaces.external.mac = MacAddr([0x01, 0, 0x5e, 0, 0, 1]);
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("not a unicast")));
    }

    #[test]
    fn test_missing_device_warning() {
        let mut config = make_config();
        config.interfaces.external.device = None;
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("no device")));
    }

    #[test]
    fn test_default_route_requires_gateway() {
        let mut config = make_config();
        config.interfaces.internal.routes.push(RouteConfig {
            destination: "0.0.0.0/0".to_string(),
            interface: InterfaceId::External,
            gateway: None,
        });
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("default route requires a gateway")));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = make_config();
        config.limits.pending_packets = 0;
        config.limits.buffer_size = 512;
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("pending_packets")));
        assert!(result.errors.iter().any(|e| e.contains("buffer_size")));
    }

    #[test]
    fn test_routes_limit_counts_connected() {
        let mut config = make_config();
        config.limits.routes = 2;
        config.interfaces.internal.routes.push(RouteConfig {
            destination: "10.0.0.0/8".to_string(),
            interface: InterfaceId::External,
            gateway: Some(Ipv4Addr::new(203, 0, 113, 254)),
        });
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("limits.routes")));
    }

    #[test]
    fn test_nat_port_overflow() {
        let mut config = make_config();
        config.interfaces.internal.nat = Some(NatConfig {
            address: Ipv4Addr::new(203, 0, 113, 1),
            base_port: 65000,
            capacity: 1000,
        });
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("port space")));
    }

    #[test]
    fn test_nat_address_mismatch_warns() {
        let mut config = make_config();
        config.interfaces.internal.nat = Some(NatConfig {
            address: Ipv4Addr::new(198, 51, 100, 1),
            base_port: 40000,
            capacity: 16,
        });
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("interfaces.internal.nat.address")));
    }
}
