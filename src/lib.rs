//! twinwall - two-interface firewall/router
//!
//! Forwarding engine with longest-prefix-match routing, an ARP cache with a
//! pending-packet arena, a mirrored NAT translator and an ICMP generator.
//! Stages talk through fixed-capacity single-producer/single-consumer rings.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result, TableError};
