//! The UDP driver (C7): a single-threaded `mio::Poll` reactor speaking NOM-1 over datagrams.
//!
//! Grounded in the `scaproust` reference file's event-loop shape (one `Poll`, one token per
//! registered resource, a control channel woken via a dedicated token) since `uflow`'s own
//! `Client`/`Server` step loop has no equivalent to multiplexing an arbitrary number of sockets
//! plus per-peering timers in one blocking call (`SPEC_FULL.md` §4.6).
//!
//! One `mio::net::UdpSocket` is kept per binding, stored on the owning [`Vocket`]'s `bindings`
//! map; `connect()` without a prior `bind()` auto-creates an ephemeral `0.0.0.0:0` binding. In
//! practice a UDP vocket never needs more than one binding, so this is a simplification of the
//! literal "bindings map" rather than a behavior change.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Token};

use crate::addr::Endpoint;
use crate::binding::Binding;
use crate::config::DriverConfig;
use crate::driver::{ControlRequest, Counters, DriverContext, DriverRuntime, VocketId, CONTROL_TOKEN};
use crate::error::{ConfigErrorKind, Error, ReplyCode};
use crate::nom1::{Command, DecodeError, Frame};
use crate::peering::{Peering, PeeringAction};
use crate::vocket::{InboundOutcome, OutboundDispatch, Vocket};

/// Entry-point value registered with the engine for the `udp` scheme.
pub struct UdpDriver {
    config: DriverConfig,
}

impl UdpDriver {
    pub fn new() -> Self {
        Self { config: DriverConfig::default() }
    }

    /// Builds a driver that applies `config`'s NOM-1 timing, datagram size ceiling, and
    /// broadcast resolver instead of the defaults.
    pub fn with_config(config: DriverConfig) -> Self {
        Self { config }
    }
}

impl Default for UdpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRuntime for UdpDriver {
    fn run(self: Box<Self>, ctx: DriverContext) {
        Reactor::new(ctx, self.config).run();
    }
}

struct Reactor {
    poll: mio::Poll,
    control_rx: std::sync::mpsc::Receiver<ControlRequest>,
    vockets: HashMap<VocketId, Vocket>,
    /// Which vocket owns the binding registered under a given token.
    token_owner: HashMap<Token, (VocketId, SocketAddr)>,
    next_token: usize,
    config: DriverConfig,
    counters: Counters,
}

impl Reactor {
    fn new(ctx: DriverContext, config: DriverConfig) -> Self {
        Self {
            poll: ctx.poll,
            control_rx: ctx.control_rx,
            vockets: HashMap::new(),
            token_owner: HashMap::new(),
            next_token: 1,
            config,
            counters: Counters::default(),
        }
    }

    fn mint_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(128);

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(target: "vocket::driver::udp", "poll failed: {}", e);
                continue;
            }

            for event in events.iter() {
                if event.token() == CONTROL_TOKEN {
                    if !self.drain_control() {
                        return;
                    }
                } else if let Some(&(id, local)) = self.token_owner.get(&event.token()) {
                    self.readable(id, local);
                }
            }

            self.tick_all(Instant::now());
            self.drain_outbound();
        }
    }

    /// The coalesced timeout for the next `Poll::poll` call: the soonest deadline any peering,
    /// across every vocket, needs attention by (`§4.6`).
    fn poll_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let soonest = self
            .vockets
            .values()
            .flat_map(|v| v.peerings.values())
            .map(|p| p.next_deadline())
            .min();

        match soonest {
            None => Some(Duration::from_secs(1)),
            Some(deadline) => Some(deadline.saturating_duration_since(now)),
        }
    }

    fn drain_control(&mut self) -> bool {
        loop {
            match self.control_rx.try_recv() {
                Ok(ControlRequest::Bind { id, vocket, endpoint, reply }) => {
                    let code = self.handle_bind(id, vocket, endpoint);
                    let _ = reply.send(code.as_i32());
                }
                Ok(ControlRequest::Connect { id, vocket, endpoint, reply }) => {
                    let code = self.handle_connect(id, vocket, endpoint);
                    let _ = reply.send(code.as_i32());
                }
                Ok(ControlRequest::Close { id, reply }) => {
                    self.handle_close(id);
                    let _ = reply.send(ReplyCode::Ok.as_i32());
                }
                Ok(ControlRequest::GetMeta { id, key, reply }) => {
                    let value = self.handle_getmeta(id, &key);
                    let _ = reply.send(value);
                }
                Ok(ControlRequest::Counters { reply }) => {
                    let _ = reply.send(self.counters);
                }
                Ok(ControlRequest::Shutdown) => return false,
                Err(std::sync::mpsc::TryRecvError::Empty) => return true,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn adopt(&mut self, id: VocketId, vocket: Option<Vocket>) -> Result<(), Error> {
        if let Some(vocket) = vocket {
            self.vockets.insert(id, vocket);
        }
        if !self.vockets.contains_key(&id) {
            return Err(Error::Config(ConfigErrorKind::AlreadyBound));
        }
        Ok(())
    }

    fn handle_bind(&mut self, id: VocketId, vocket: Option<Vocket>, endpoint: Endpoint) -> ReplyCode {
        if let Err(e) = self.adopt(id, vocket) {
            return e.reply_code();
        }

        let local = match endpoint.resolve_local() {
            Ok(addr) => addr,
            Err(e) => return e.reply_code(),
        };

        match self.bind_socket(id, local) {
            Ok(()) => ReplyCode::Ok,
            Err(e) => {
                self.counters.errors += 1;
                warn!(target: "vocket::driver::udp", "bind {} failed: {}", endpoint, e);
                ReplyCode::Generic
            }
        }
    }

    fn bind_socket(&mut self, id: VocketId, local: SocketAddr) -> Result<(), Error> {
        if self.vockets.get(&id).map(|v| v.bindings.contains_key(&local)) == Some(true) {
            return Ok(());
        }

        let mut socket = UdpSocket::bind(local)?;
        socket.set_broadcast(true)?;
        let registered_local = local_or(&socket, local);

        let token = self.mint_token();
        self.poll.registry().register(&mut socket, token, Interest::READABLE)?;

        let vocket = self.vockets.get_mut(&id).expect("adopted above");
        vocket.bindings.insert(registered_local, Binding::new(registered_local, socket, token));
        self.token_owner.insert(token, (id, registered_local));

        Ok(())
    }

    fn handle_connect(&mut self, id: VocketId, vocket: Option<Vocket>, endpoint: Endpoint) -> ReplyCode {
        if let Err(e) = self.adopt(id, vocket) {
            return e.reply_code();
        }

        let broadcast = endpoint.is_wildcard();
        let remote = match endpoint.resolve_remote_or_broadcast(self.config.resolver.as_ref()) {
            Ok(addr) => addr,
            Err(e) => return e.reply_code(),
        };

        if self.vockets.get(&id).map(|v| v.bindings.is_empty()) == Some(true) {
            let ephemeral: SocketAddr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
            if let Err(e) = self.bind_socket(id, ephemeral) {
                self.counters.errors += 1;
                warn!(target: "vocket::driver::udp", "ephemeral bind failed: {}", e);
                return ReplyCode::Generic;
            }
        }

        let vocket = self.vockets.get_mut(&id).expect("adopted above");

        if let Some(reason) = vocket.reject_reason_for_new_peering() {
            warn!(target: "vocket::driver::udp", "connect rejected: {}", reason);
            return ReplyCode::Enotsup;
        }

        let now = Instant::now();
        let scheme = vocket.scheme.clone();
        let peering = Peering::new_outgoing(&scheme, remote, broadcast, now)
            .with_timing(self.config.timeout, self.config.ohai_ivl);
        let key = peering.key.clone();
        vocket.insert_peering(peering);

        self.fire_immediate(id, &key, now);

        ReplyCode::Ok
    }

    /// Answers a metadata query. `"sender"` is the only key defined (`§6`).
    fn handle_getmeta(&self, id: VocketId, key: &str) -> Option<String> {
        match key {
            "sender" => self.vockets.get(&id)?.last_sender.map(|a| a.to_string()),
            _ => None,
        }
    }

    fn handle_close(&mut self, id: VocketId) {
        if let Some(vocket) = self.vockets.remove(&id) {
            for (_, binding) in vocket.bindings.into_iter() {
                let mut socket = binding.socket;
                let _ = self.poll.registry().deregister(&mut socket);
                self.token_owner.remove(&binding.token);
            }
        }
    }

    /// Runs a freshly created peering's first `tick()` immediately, so a connect doesn't wait
    /// for the next scheduled wakeup to send its first OHAI.
    fn fire_immediate(&mut self, id: VocketId, key: &str, now: Instant) {
        let action = {
            let vocket = self.vockets.get_mut(&id).expect("vocket present");
            let Some(peering) = vocket.peerings.get_mut(key) else { return };
            peering.tick(now)
        };
        self.apply_action(id, key, action);
    }

    fn tick_all(&mut self, now: Instant) {
        let ids: Vec<VocketId> = self.vockets.keys().copied().collect();
        for id in ids {
            let keys: Vec<String> = match self.vockets.get(&id) {
                Some(v) => v.peerings.keys().cloned().collect(),
                None => continue,
            };
            for key in keys {
                let action = {
                    let Some(vocket) = self.vockets.get_mut(&id) else { continue };
                    let Some(peering) = vocket.peerings.get_mut(&key) else { continue };
                    peering.tick(now)
                };
                self.apply_action(id, &key, action);
            }
        }
    }

    /// Applies a [`PeeringAction`]'s map-bookkeeping side effect, then sends whatever datagram
    /// (if any) the action calls for.
    fn apply_action(&mut self, id: VocketId, key: &str, action: PeeringAction) {
        if matches!(action, PeeringAction::None) {
            return;
        }

        let Some(vocket) = self.vockets.get_mut(&id) else { return };
        let scheme = vocket.scheme.clone();
        let sequence = vocket.peerings.get(key).map(|p| p.sequence).unwrap_or(0);

        vocket.apply_peering_action(key, &action);

        let send = match &action {
            PeeringAction::SendOhai { to } => {
                Some((*to, Frame::new(Command::Ohai, sequence, format!("{}://{}", scheme, to).into_bytes())))
            }
            PeeringAction::SendOhaiOk { to, echo_body } => {
                Some((*to, Frame::new(Command::OhaiOk, sequence, echo_body.clone())))
            }
            PeeringAction::SendHugz { to } => Some((*to, Frame::new(Command::Hugz, sequence, Vec::new()))),
            PeeringAction::Rekey { new_remote, .. } => {
                Some((*new_remote, Frame::new(Command::Ohai, sequence, format!("{}://{}", scheme, new_remote).into_bytes())))
            }
            _ => None,
        };

        if let Some((to, frame)) = send {
            self.send_frame(id, to, &frame);
        }
    }

    fn send_frame(&mut self, id: VocketId, to: SocketAddr, frame: &Frame) {
        let Some(vocket) = self.vockets.get(&id) else { return };
        let Some(binding) = vocket.bindings.values().next() else {
            warn!(target: "vocket::driver::udp", "no binding to send from");
            return;
        };

        let bytes = frame.write();
        match binding.socket.send_to(&bytes, to) {
            Ok(_) => self.counters.sends += 1,
            Err(e) => {
                self.counters.errors += 1;
                warn!(target: "vocket::driver::udp", "send to {} failed: {}", to, e);
            }
        }
    }

    fn readable(&mut self, id: VocketId, local: SocketAddr) {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        loop {
            let recv = {
                let Some(vocket) = self.vockets.get(&id) else { return };
                let Some(binding) = vocket.bindings.get(&local) else { return };
                binding.socket.recv_from(&mut buf)
            };

            let (n, source) = match recv {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.counters.errors += 1;
                    warn!(target: "vocket::driver::udp", "recv failed: {}", e);
                    return;
                }
            };

            self.counters.receives += 1;
            self.handle_datagram(id, source, &buf[..n]);
        }
    }

    fn handle_datagram(&mut self, id: VocketId, source: SocketAddr, data: &[u8]) {
        let frame = match Frame::read(data) {
            Ok(f) => f,
            Err(DecodeError::Truncated) => {
                debug!(target: "vocket::driver::udp", "dropped truncated datagram from {}", source);
                return;
            }
            Err(DecodeError::VersionMismatch(v)) => {
                debug!(target: "vocket::driver::udp", "dropped datagram with version {} from {}", v, source);
                return;
            }
            Err(DecodeError::UnknownCommand(c)) => {
                debug!(target: "vocket::driver::udp", "dropped datagram with unknown command {} from {}", c, source);
                return;
            }
        };

        let Some(scheme) = self.vockets.get(&id).map(|v| v.scheme.clone()) else { return };
        let broadcast_key = crate::addr::peer_key(&scheme, source);

        match frame.command {
            Command::Ohai => {
                let now = Instant::now();

                let known = self.vockets.get(&id).map(|v| v.peerings.contains_key(&broadcast_key)) == Some(true);
                if !known {
                    let reason = self.vockets.get(&id).and_then(|v| v.reject_reason_for_new_peering());
                    if let Some(reason) = reason {
                        self.send_frame(id, source, &Frame::new(Command::Rotfl, 0, reason.as_bytes().to_vec()));
                        return;
                    }
                    let timing = (self.config.timeout, self.config.ohai_ivl);
                    if let Some(vocket) = self.vockets.get_mut(&id) {
                        vocket.insert_peering(
                            Peering::new_incoming(&scheme, source, now).with_timing(timing.0, timing.1),
                        );
                    }
                }

                let action = {
                    let Some(vocket) = self.vockets.get_mut(&id) else { return };
                    let Some(peering) = vocket.peerings.get_mut(&broadcast_key) else { return };
                    peering.on_ohai(frame.body, now)
                };
                self.apply_action(id, &broadcast_key, action);
            }

            Command::OhaiOk => {
                let echoed = std::str::from_utf8(&frame.body)
                    .ok()
                    .and_then(|s| crate::addr::strip_scheme(s).parse::<SocketAddr>().ok());
                let now = Instant::now();

                let Some(key) = self.vockets.get(&id).and_then(|v| find_peering_key(v, source)) else { return };
                let action = {
                    let Some(vocket) = self.vockets.get_mut(&id) else { return };
                    let Some(peering) = vocket.peerings.get_mut(&key) else { return };
                    peering.on_ohai_ok(echoed, source, now)
                };
                self.apply_action(id, &key, action);
            }

            Command::Hugz => {
                let now = Instant::now();
                if let Some(vocket) = self.vockets.get_mut(&id) {
                    if let Some(peering) = vocket.peerings.get_mut(&broadcast_key) {
                        peering.on_inbound(now);
                    }
                }
                self.send_frame(id, source, &Frame::new(Command::HugzOk, frame.sequence, Vec::new()));
            }

            Command::HugzOk => {
                if let Some(vocket) = self.vockets.get_mut(&id) {
                    if let Some(peering) = vocket.peerings.get_mut(&broadcast_key) {
                        peering.on_inbound(Instant::now());
                    }
                }
            }

            Command::Nom => {
                let Some(key) = self.vockets.get(&id).and_then(|v| find_peering_key(v, source)) else { return };

                let outcome = {
                    let Some(vocket) = self.vockets.get_mut(&id) else { return };
                    if let Some(peering) = vocket.peerings.get_mut(&key) {
                        peering.on_inbound(Instant::now());
                    }
                    vocket.handle_nom(&key, frame.sequence, frame.body, source)
                };

                match outcome {
                    InboundOutcome::Deliver(frames) => {
                        let delivered = self.vockets.get(&id).map(|v| v.deliver_inbound(frames));
                        if matches!(delivered, Some(Err(_))) {
                            debug!(target: "vocket::driver::udp", "application pipe closed, dropping delivery");
                        }
                    }
                    InboundOutcome::Resend { peering_key, body } => {
                        let sequence = self.vockets.get(&id).and_then(|v| v.peerings.get(&peering_key)).map(|p| p.sequence);
                        if let Some(sequence) = sequence {
                            self.send_frame(id, source, &Frame::new(Command::Nom, sequence, body));
                        }
                    }
                    InboundOutcome::Drop(reason) => {
                        debug!(target: "vocket::driver::udp", "dropped NOM from {}: {}", source, reason);
                    }
                }
            }

            Command::Rotfl => {
                debug!(target: "vocket::driver::udp", "peer {} rejected us: {}", source, String::from_utf8_lossy(&frame.body));
            }
        }
    }

    /// Drains every vocket's application-side outbound queue, dispatching each message per its
    /// routing policy. Run once per reactor wakeup; see the module doc for the resulting
    /// latency bound.
    fn drain_outbound(&mut self) {
        let ids: Vec<VocketId> = self.vockets.keys().copied().collect();
        for id in ids {
            loop {
                let frames = {
                    let Some(vocket) = self.vockets.get(&id) else { break };
                    match vocket.try_recv_outbound() {
                        Some(f) => f,
                        None => break,
                    }
                };

                let dispatch = {
                    let vocket = self.vockets.get_mut(&id).expect("present");
                    vocket.dispatch_outbound(frames)
                };

                match dispatch {
                    OutboundDispatch::SendNom { peering_key, body } => {
                        if let Some(vocket) = self.vockets.get(&id) {
                            if let Some(peering) = vocket.peerings.get(&peering_key) {
                                let to = peering.remote;
                                let sequence = peering.sequence;
                                self.send_frame(id, to, &Frame::new(Command::Nom, sequence, body));
                            }
                        }
                    }
                    OutboundDispatch::SendNomToMany { peering_keys, body } => {
                        for peering_key in peering_keys {
                            if let Some(vocket) = self.vockets.get(&id) {
                                if let Some(peering) = vocket.peerings.get(&peering_key) {
                                    let to = peering.remote;
                                    let sequence = peering.sequence;
                                    self.send_frame(id, to, &Frame::new(Command::Nom, sequence, body.clone()));
                                }
                            }
                        }
                    }
                    OutboundDispatch::Reject { reason } => {
                        debug!(target: "vocket::driver::udp", "outbound message rejected: {}", reason);
                    }
                }
            }
        }
    }
}

fn local_or(socket: &UdpSocket, fallback: SocketAddr) -> SocketAddr {
    socket.local_addr().unwrap_or(fallback)
}

/// Finds the peering key a datagram from `source` belongs to: either the concrete key, or (for
/// a still-broadcast-keyed outgoing peering awaiting its first reply) the broadcast key.
fn find_peering_key(vocket: &Vocket, source: SocketAddr) -> Option<String> {
    let concrete = crate::addr::peer_key(&vocket.scheme, source);
    if vocket.peerings.contains_key(&concrete) {
        return Some(concrete);
    }

    vocket
        .peerings
        .values()
        .find(|p| p.broadcast && p.broadcast_remote == Some(source) || p.broadcast && p.remote == source)
        .map(|p| p.key.clone())
}
