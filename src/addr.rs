//! Endpoint parsing and address utilities (C3 / C10).
//!
//! `scheme://host:port` parsing, wildcard resolution, and canonical peer keys. Grounded in
//! `std::net::SocketAddr`'s own `Display`/`ToSocketAddrs` machinery rather than a hand-rolled
//! parser or formatter — per the design notes' "Static string buffers" warning, a peer key is
//! always an owned `SocketAddr` (or, for the broadcast case, a plain enum), never a borrowed
//! pointer into scratch space.

use std::fmt;
use std::net::{self, SocketAddr, ToSocketAddrs};

use crate::error::{ConfigErrorKind, Error};

/// A parsed `scheme://host:port` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The scheme, e.g. `"udp"` or `"tcp"`.
    pub scheme: String,
    /// The host portion, either a concrete hostname/IP or `"*"` for the wildcard address.
    pub host: String,
    /// The port portion.
    pub port: u16,
}

impl Endpoint {
    /// Parses a `scheme://host:port` string.
    ///
    /// Returns [`ConfigErrorKind::MalformedEndpoint`] if the `scheme://` separator, host, or
    /// port are missing or the port does not parse as a `u16`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (scheme, rest) = s.split_once("://").ok_or_else(|| {
            Error::Config(ConfigErrorKind::MalformedEndpoint(s.to_string()))
        })?;

        if scheme.is_empty() {
            return Err(Error::Config(ConfigErrorKind::MalformedEndpoint(s.to_string())));
        }

        let (host, port_str) = rest.rsplit_once(':').ok_or_else(|| {
            Error::Config(ConfigErrorKind::MalformedEndpoint(s.to_string()))
        })?;

        if host.is_empty() || port_str.is_empty() {
            return Err(Error::Config(ConfigErrorKind::MalformedEndpoint(s.to_string())));
        }

        let port: u16 = port_str.parse().map_err(|_| {
            Error::Config(ConfigErrorKind::MalformedEndpoint(s.to_string()))
        })?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Returns `true` if the host portion is the wildcard `*`.
    pub fn is_wildcard(&self) -> bool {
        self.host == "*"
    }

    /// Resolves the local bind address for this endpoint: `*` becomes "any interface"
    /// (`0.0.0.0` / `[::]`), otherwise the host is resolved via [`ToSocketAddrs`].
    pub fn resolve_local(&self) -> Result<SocketAddr, Error> {
        if self.is_wildcard() {
            return Ok(SocketAddr::new(net::IpAddr::V4(net::Ipv4Addr::UNSPECIFIED), self.port));
        }

        self.resolve_remote()
    }

    /// Resolves the remote address this endpoint names, given a broadcast capability to call
    /// when the host is the wildcard `*` (see [`BroadcastResolver`]).
    pub fn resolve_remote_or_broadcast(&self, resolver: &dyn BroadcastResolver) -> Result<SocketAddr, Error> {
        if self.is_wildcard() {
            return resolver.resolve_broadcast(self.port).map_err(Error::from);
        }

        self.resolve_remote()
    }

    fn resolve_remote(&self) -> Result<SocketAddr, Error> {
        let addr_str = format!("{}:{}", self.host, self.port);

        addr_str
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or_else(|| Error::Config(ConfigErrorKind::MalformedEndpoint(addr_str.clone())))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A capability for resolving "the broadcast address" on this host, injectable for tests.
///
/// Enumerating network interfaces and picking the last valid broadcast address is
/// platform-specific (see `SPEC_FULL.md` design notes, "Broadcast selection"); this trait lets
/// the reactor depend on the capability abstractly and supply a fixed address in tests.
///
/// `Send + Sync` so a resolver can be shared, via [`crate::config::DriverConfig`], across the
/// engine thread and a driver's own reactor thread.
pub trait BroadcastResolver: Send + Sync {
    /// Returns the broadcast [`SocketAddr`] to use for outgoing connections to `*:port`.
    fn resolve_broadcast(&self, port: u16) -> io_result::Result<SocketAddr>;
}

mod io_result {
    pub type Result<T> = std::result::Result<T, std::io::Error>;
}

/// The platform-default [`BroadcastResolver`]: the IPv4 limited broadcast address
/// `255.255.255.255`.
///
/// A production implementation would enumerate interfaces and pick the last valid broadcast
/// address found, as the design notes describe; the limited broadcast address is a correct,
/// platform-independent default that every IPv4 stack accepts for a local subnet, and is what
/// this crate uses absent an injected resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultBroadcastResolver;

impl BroadcastResolver for DefaultBroadcastResolver {
    fn resolve_broadcast(&self, port: u16) -> io_result::Result<SocketAddr> {
        Ok(SocketAddr::new(net::IpAddr::V4(net::Ipv4Addr::new(255, 255, 255, 255)), port))
    }
}

/// Formats a [`SocketAddr`] as the canonical `scheme://host:port` peer key used in ROUTER
/// identity frames (`§4.4`).
pub fn peer_key(scheme: &str, addr: SocketAddr) -> String {
    format!("{}://{}", scheme, addr)
}

/// Strips a `scheme://` prefix from a peer key, returning the bare `host:port` suffix.
///
/// Used by the ROUTER routing policy to recover the address a caller addressed by identity
/// frame (`"udp://host:port"` in `§4.4`).
pub fn strip_scheme(key: &str) -> &str {
    key.split_once("://").map(|(_, rest)| rest).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_concrete_endpoint() {
        let ep = Endpoint::parse("udp://127.0.0.1:32000").unwrap();
        assert_eq!(ep.scheme, "udp");
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 32000);
        assert!(!ep.is_wildcard());
    }

    #[test]
    fn parses_wildcard_endpoint() {
        let ep = Endpoint::parse("udp://*:32000").unwrap();
        assert!(ep.is_wildcard());
        assert_eq!(ep.resolve_local().unwrap().port(), 32000);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Endpoint::parse("127.0.0.1:32000").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(Endpoint::parse("udp://127.0.0.1").is_err());
    }

    #[test]
    fn rejects_empty_scheme() {
        assert!(Endpoint::parse("://127.0.0.1:1").is_err());
    }

    #[test]
    fn strip_scheme_removes_prefix() {
        assert_eq!(strip_scheme("udp://127.0.0.1:9"), "127.0.0.1:9");
        assert_eq!(strip_scheme("127.0.0.1:9"), "127.0.0.1:9");
    }

    #[test]
    fn default_broadcast_resolver_uses_limited_broadcast() {
        let resolver = DefaultBroadcastResolver;
        let addr = resolver.resolve_broadcast(9).unwrap();
        assert_eq!(addr, "255.255.255.255:9".parse().unwrap());
    }
}
