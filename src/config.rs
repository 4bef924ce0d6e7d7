//! Driver configuration (ambient stack, `SPEC_FULL.md` §3 "Config").
//!
//! Grounded in `uflow::EndpointConfig`/`endpoint::Params`'s builder-plus-`is_valid()` style:
//! a plain struct of knobs, a `Default` impl supplying the values the design calls out (`§4.3`,
//! `§4.5`), and a validation predicate checked once at construction rather than scattered
//! `assert!`s through the reactor.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::addr::BroadcastResolver;
use crate::peering::{OHAI_IVL, TIMEOUT};
use crate::socket_type::DEFAULT_MAX_PEERINGS;

/// The largest datagram the UDP driver will attempt to read, and the ceiling this crate quotes
/// in `§6`'s "Application pipe" contract (512 bytes is the design-level example; this crate's
/// default is a conservative MTU-safe UDP payload size, see the UDP driver module doc).
pub const DEFAULT_MAX_DATAGRAM: usize = 65_507;

/// A fixed broadcast resolver, for tests and embedders that already know the LAN broadcast
/// address and don't need [`crate::addr::DefaultBroadcastResolver`]'s interface enumeration.
#[derive(Clone, Copy, Debug)]
pub struct FixedBroadcastResolver(pub SocketAddr);

impl BroadcastResolver for FixedBroadcastResolver {
    fn resolve_broadcast(&self, port: u16) -> std::io::Result<SocketAddr> {
        let mut addr = self.0;
        addr.set_port(port);
        Ok(addr)
    }
}

/// Per-driver configuration: NOM-1 timing, the datagram size ceiling, the default peerings
/// ceiling, and the broadcast-resolution capability (`§9`, "Broadcast selection").
#[derive(Clone)]
pub struct DriverConfig {
    /// Liveness window: a peering with no inbound traffic for this long is declared silent.
    pub timeout: Duration,
    /// Connect retry interval while a peering is connecting or reconnecting from silence.
    pub ohai_ivl: Duration,
    /// The largest datagram the UDP driver will attempt to read in one call.
    pub max_datagram_size: usize,
    /// The peerings ceiling applied when a vocket's pattern doesn't name a tighter one of its
    /// own (`PAIR`'s `1/1` bound always wins; see `socket_type::SocketType::traits`).
    pub default_max_peerings: usize,
    /// How to resolve "the broadcast address" for outgoing connects to a wildcard endpoint.
    pub resolver: Arc<dyn BroadcastResolver + Send + Sync>,
}

impl DriverConfig {
    /// `true` if every field holds a usable value: nonzero timing, `ohai_ivl` strictly shorter
    /// than `timeout` (otherwise a connecting peering would never retry before giving up), and
    /// a datagram size large enough to hold at least a bare NOM-1 header.
    pub fn is_valid(&self) -> bool {
        self.timeout > Duration::ZERO
            && self.ohai_ivl > Duration::ZERO
            && self.ohai_ivl < self.timeout
            && self.max_datagram_size >= 2
            && self.default_max_peerings > 0
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT,
            ohai_ivl: OHAI_IVL,
            max_datagram_size: DEFAULT_MAX_DATAGRAM,
            default_max_peerings: DEFAULT_MAX_PEERINGS,
            resolver: Arc::new(crate::addr::DefaultBroadcastResolver),
        }
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("timeout", &self.timeout)
            .field("ohai_ivl", &self.ohai_ivl)
            .field("max_datagram_size", &self.max_datagram_size)
            .field("default_max_peerings", &self.default_max_peerings)
            .finish()
    }
}

/// The IPv4 limited broadcast address, `255.255.255.255`, with no port set (callers fill one
/// in); a convenience constant for building a [`FixedBroadcastResolver`] in tests.
pub const LIMITED_BROADCAST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DriverConfig::default().is_valid());
    }

    #[test]
    fn ohai_ivl_must_be_shorter_than_timeout() {
        let mut cfg = DriverConfig::default();
        cfg.ohai_ivl = cfg.timeout;
        assert!(!cfg.is_valid());
    }

    #[test]
    fn zero_peerings_ceiling_is_invalid() {
        let mut cfg = DriverConfig::default();
        cfg.default_max_peerings = 0;
        assert!(!cfg.is_valid());
    }

    #[test]
    fn fixed_broadcast_resolver_fills_in_the_requested_port() {
        let resolver = FixedBroadcastResolver(SocketAddr::new(LIMITED_BROADCAST_IP, 0));
        let resolved = resolver.resolve_broadcast(9000).unwrap();
        assert_eq!(resolved.port(), 9000);
        assert_eq!(resolved.ip(), LIMITED_BROADCAST_IP);
    }
}
