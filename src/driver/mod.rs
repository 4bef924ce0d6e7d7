//! Driver reactor (C7): a single-threaded event loop per registered scheme.
//!
//! Addendum (`SPEC_FULL.md` §4.6): `uflow`'s own `Client`/`Server` poll model
//! (`step()`/`flush()`, caller-driven) doesn't multiplex a control pipe, network handles, and
//! per-peering timers within one blocking call, which this component requires. The reactor is
//! instead built on `mio::Poll`, grounded in the `scaproust` reference file, while reusing what
//! of `uflow`'s shape still applies: the `HashMap<SocketAddr, _>` keying style and
//! `is_zombie`/retain-based cleanup (see `peering`/`vocket`).
//!
//! A driver is a value passed to [`crate::Engine::register`] (`§9`, "Driver registration" — no
//! global mutable registry); it owns a single entry point, [`DriverRuntime::run`], spawned on
//! its own OS thread by the engine. The control pipe is a plain `mpsc` channel; since `mpsc`
//! receivers are not themselves `mio` event sources, a `mio::Waker` registered under
//! [`CONTROL_TOKEN`] wakes the reactor's `Poll::poll` when a control request arrives, exactly
//! the "control pipe's receive half... as a source" multiplexing `§4.6` asks for.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;

use mio::{Poll, Token, Waker};

use crate::addr::Endpoint;
use crate::error::Error;
use crate::vocket::Vocket;

/// The `mio` registration token the control-pipe waker fires under. Binding/peering sockets
/// use every other token value, minted by each driver's own token allocator.
pub const CONTROL_TOKEN: Token = Token(0);

/// The identifier the engine uses to refer to a vocket across the control pipe.
pub type VocketId = u64;

/// A BIND/CONNECT/CLOSE request sent from the engine to a driver's control pipe (`§4.6`).
///
/// `vocket` carries ownership across on first use for a given id (the vocket moves from the
/// engine's provisional registry into the driver's own `vockets` map); subsequent requests for
/// an already-adopted id leave it `None` and the driver looks the vocket up by `id`.
pub enum ControlRequest {
    Bind { id: VocketId, vocket: Option<Vocket>, endpoint: Endpoint, reply: mpsc::Sender<i32> },
    Connect { id: VocketId, vocket: Option<Vocket>, endpoint: Endpoint, reply: mpsc::Sender<i32> },
    Close { id: VocketId, reply: mpsc::Sender<i32> },
    /// Metadata query (`§6`): currently only `key == "sender"`, the last inbound sender's
    /// address, is defined.
    GetMeta { id: VocketId, key: String, reply: mpsc::Sender<Option<String>> },
    /// Reads this driver's cumulative [`Counters`] (`§3`, "Metrics").
    Counters { reply: mpsc::Sender<Counters> },
    Shutdown,
}

/// Per-driver counters, exposed to the embedder for observability (`§3`, Driver).
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub sends: u64,
    pub receives: u64,
    pub errors: u64,
}

/// What a driver needs to run its reactor loop: the control pipe's receive half, the scheme it
/// was registered under, and the `Poll` instance its [`DriverHandle`]'s waker was minted from.
///
/// The `Poll` is created before the reactor thread is spawned (see [`spawn`]) because the
/// engine-side [`Waker`] must be registered against it ahead of time; the reactor thread then
/// takes ownership of it, `Poll` itself being `Send`.
pub struct DriverContext {
    pub scheme: String,
    pub control_rx: mpsc::Receiver<ControlRequest>,
    pub poll: Poll,
}

/// A registered driver: a scheme string plus a single entry point, the reactor body.
pub trait DriverRuntime: Send {
    /// Runs the reactor to completion (until [`ControlRequest::Shutdown`]). Called on the
    /// driver's own OS thread by the engine.
    fn run(self: Box<Self>, ctx: DriverContext);
}

/// The engine-side handle to a running driver: how to reach its control pipe and wake it.
pub struct DriverHandle {
    pub control_tx: mpsc::Sender<ControlRequest>,
    pub waker: Arc<mio::Waker>,
    pub join: std::thread::JoinHandle<()>,
}

impl DriverHandle {
    /// Sends a control request and wakes the reactor so it is serviced promptly, rather than
    /// waiting for the next naturally scheduled timer tick.
    pub fn send(&self, request: ControlRequest) -> Result<(), Error> {
        self.control_tx
            .send(request)
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "driver control pipe closed")))?;
        self.waker
            .wake()
            .map_err(Error::from)
    }

    /// Reads this driver's cumulative [`Counters`], waiting for the reactor to service the
    /// request on its next wakeup.
    pub fn counters(&self) -> Counters {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.send(ControlRequest::Counters { reply: reply_tx }).is_err() {
            return Counters::default();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

/// Looks up the vocket a readable `mio` handle belongs to, given the socket-address keying the
/// binding was registered under. Shared by the UDP and TCP reactors.
pub(crate) fn local_addr_or_panic(result: std::io::Result<SocketAddr>) -> SocketAddr {
    result.expect("bound socket must have a local address")
}

/// Creates a driver's control pipe and `mio` waker, then spawns its reactor loop on a dedicated
/// OS thread, returning the engine-side handle (`§9`, "Driver registration").
pub fn spawn(scheme: &str, driver: Box<dyn DriverRuntime + 'static>) -> Result<DriverHandle, Error> {
    let poll = Poll::new().map_err(Error::from)?;
    let waker = Arc::new(Waker::new(poll.registry(), CONTROL_TOKEN).map_err(Error::from)?);
    let (control_tx, control_rx) = mpsc::channel();

    let ctx = DriverContext { scheme: scheme.to_string(), control_rx, poll };

    let join = std::thread::Builder::new()
        .name(format!("vocket-driver-{}", scheme))
        .spawn(move || driver.run(ctx))
        .expect("failed to spawn driver reactor thread");

    Ok(DriverHandle { control_tx, waker, join })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_default_to_zero() {
        let c = Counters::default();
        assert_eq!(c.sends, 0);
        assert_eq!(c.receives, 0);
        assert_eq!(c.errors, 0);
    }
}
