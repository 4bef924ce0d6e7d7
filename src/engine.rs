//! Engine (C8): the process-wide registry of drivers by scheme, vocket creation, and
//! control-pipe marshalling for BIND/CONNECT/CLOSE/GETMETA.
//!
//! Grounded in `§4.7`/`§9`'s "Driver registration" design note: drivers are values passed to
//! [`Engine::register`], never looked up through a global mutable registry. The engine itself
//! owns the `scheme -> DriverHandle` map and is expected to be created once per process, before
//! any socket is created, and destroyed last.

use std::collections::HashMap;
use std::sync::mpsc;

use crate::addr::Endpoint;
use crate::driver::{spawn, ControlRequest, DriverHandle, DriverRuntime, VocketId};
use crate::error::{ConfigErrorKind, Error, ReplyCode};
use crate::socket_type::SocketType;
use crate::vocket::{Vocket, VocketHandle};

/// A socket the application holds: its application-pipe handle, plus the vocket value itself
/// until a driver adopts it on first `bind`/`connect`.
struct Socket {
    /// `Some` until the first successful `bind`/`connect` moves ownership to a driver.
    pending: Option<Vocket>,
    handle: VocketHandle,
    /// The scheme this socket is attached to, once bound or connected.
    scheme: Option<String>,
}

/// The process-wide registry of drivers and vockets (`§3`, Engine).
pub struct Engine {
    drivers: HashMap<String, DriverHandle>,
    sockets: HashMap<VocketId, Socket>,
    next_id: VocketId,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
            sockets: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a driver under `scheme`, spawning its reactor thread.
    ///
    /// Returns [`ReplyCode::Enotuniq`] if a driver is already registered for this scheme.
    pub fn register(&mut self, scheme: &str, driver: Box<dyn DriverRuntime + 'static>) -> ReplyCode {
        if self.drivers.contains_key(scheme) {
            return Error::Config(ConfigErrorKind::DuplicateDriver(scheme.to_string())).reply_code();
        }

        match spawn(scheme, driver) {
            Ok(handle) => {
                self.drivers.insert(scheme.to_string(), handle);
                ReplyCode::Ok
            }
            Err(e) => e.reply_code(),
        }
    }

    /// Creates a vocket of `socket_type`, not yet attached to any scheme.
    pub fn new_socket(&mut self, socket_type: SocketType) -> VocketId {
        let id = self.next_id;
        self.next_id += 1;

        let (vocket, handle) = Vocket::new(socket_type, "");
        self.sockets.insert(id, Socket { pending: Some(vocket), handle, scheme: None });
        id
    }

    /// Returns the application-facing pipe handle for `id`, if it exists.
    pub fn handle(&self, id: VocketId) -> Option<&VocketHandle> {
        self.sockets.get(&id).map(|s| &s.handle)
    }

    /// Binds `id` to listen at `endpoint` (`scheme://host:port`).
    pub fn bind(&mut self, id: VocketId, endpoint: &str) -> i32 {
        self.control(id, endpoint, |driver_id, vocket, endpoint, reply| ControlRequest::Bind { id: driver_id, vocket, endpoint, reply })
    }

    /// Connects `id` to a remote peer at `endpoint`.
    pub fn connect(&mut self, id: VocketId, endpoint: &str) -> i32 {
        self.control(id, endpoint, |driver_id, vocket, endpoint, reply| ControlRequest::Connect { id: driver_id, vocket, endpoint, reply })
    }

    fn control(
        &mut self,
        id: VocketId,
        endpoint: &str,
        build: impl FnOnce(VocketId, Option<Vocket>, Endpoint, mpsc::Sender<i32>) -> ControlRequest,
    ) -> i32 {
        let endpoint = match Endpoint::parse(endpoint) {
            Ok(e) => e,
            Err(e) => return e.reply_code().as_i32(),
        };

        let Some(driver) = self.drivers.get(&endpoint.scheme) else {
            return Error::Config(ConfigErrorKind::UnknownScheme(endpoint.scheme.clone())).reply_code().as_i32();
        };

        let Some(socket) = self.sockets.get_mut(&id) else {
            return ReplyCode::Einval.as_i32();
        };

        let vocket = socket.pending.take().map(|mut v| {
            v.scheme = endpoint.scheme.clone();
            v
        });
        socket.scheme = Some(endpoint.scheme.clone());

        let (reply_tx, reply_rx) = mpsc::channel();
        let request = build(id, vocket, endpoint, reply_tx);

        if driver.send(request).is_err() {
            return ReplyCode::Generic.as_i32();
        }

        reply_rx.recv().unwrap_or(ReplyCode::Generic.as_i32())
    }

    /// Closes `id`, tearing down its bindings and peerings if it was ever bound/connected.
    pub fn close(&mut self, id: VocketId) -> i32 {
        let Some(socket) = self.sockets.remove(&id) else {
            return ReplyCode::Ok.as_i32();
        };

        let Some(scheme) = socket.scheme else {
            return ReplyCode::Ok.as_i32();
        };

        let Some(driver) = self.drivers.get(&scheme) else {
            return ReplyCode::Ok.as_i32();
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        if driver.send(ControlRequest::Close { id, reply: reply_tx }).is_err() {
            return ReplyCode::Generic.as_i32();
        }
        reply_rx.recv().unwrap_or(ReplyCode::Ok.as_i32())
    }

    /// Queries per-socket metadata. Only `"sender"` (the last inbound peer's address) is
    /// defined today (`§6`).
    pub fn getmeta(&self, id: VocketId, key: &str) -> Option<String> {
        let socket = self.sockets.get(&id)?;
        let scheme = socket.scheme.as_ref()?;
        let driver = self.drivers.get(scheme)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        driver.send(ControlRequest::GetMeta { id, key: key.to_string(), reply: reply_tx }).ok()?;
        reply_rx.recv().ok().flatten()
    }

    /// Reads a registered driver's cumulative send/receive/error counters (`§3`, "Metrics").
    /// Returns `None` if `scheme` has no registered driver.
    pub fn counters(&self, scheme: &str) -> Option<crate::driver::Counters> {
        Some(self.drivers.get(scheme)?.counters())
    }

    /// Shuts down every registered driver, destroying all vockets, bindings, and peerings.
    pub fn destroy(&mut self) {
        self.sockets.clear();
        for (_, driver) in self.drivers.drain() {
            let _ = driver.control_tx.send(ControlRequest::Shutdown);
            let _ = driver.waker.wake();
            let _ = driver.join.join();
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_with_unregistered_scheme_returns_enoprotoopt() {
        let mut engine = Engine::new();
        let id = engine.new_socket(SocketType::Pair);
        assert_eq!(engine.bind(id, "udp://*:32000"), ReplyCode::Enoprotoopt.as_i32());
    }

    #[test]
    fn bind_with_malformed_endpoint_returns_einval() {
        let mut engine = Engine::new();
        let id = engine.new_socket(SocketType::Pair);
        assert_eq!(engine.bind(id, "not-an-endpoint"), ReplyCode::Einval.as_i32());
    }

    #[test]
    fn registering_duplicate_scheme_returns_enotuniq() {
        let mut engine = Engine::new();
        assert_eq!(engine.register("udp", Box::new(crate::driver::udp::UdpDriver::new())), ReplyCode::Ok);
        assert_eq!(engine.register("udp", Box::new(crate::driver::udp::UdpDriver::new())), ReplyCode::Enotuniq);
        engine.destroy();
    }

    #[test]
    fn counters_are_readable_for_a_registered_scheme_and_absent_otherwise() {
        let mut engine = Engine::new();
        engine.register("udp", Box::new(crate::driver::udp::UdpDriver::new()));

        let counters = engine.counters("udp").expect("udp is registered");
        assert_eq!(counters.sends, 0);
        assert!(engine.counters("tcp").is_none());

        engine.destroy();
    }

    #[test]
    fn bind_and_close_round_trip_on_loopback() {
        let mut engine = Engine::new();
        engine.register("udp", Box::new(crate::driver::udp::UdpDriver::new()));

        let id = engine.new_socket(SocketType::Reply);
        assert_eq!(engine.bind(id, "udp://127.0.0.1:0"), ReplyCode::Ok.as_i32());
        assert_eq!(engine.close(id), ReplyCode::Ok.as_i32());

        engine.destroy();
    }
}
