//! Vocket (C6): one virtual messaging socket. Routes outbound application messages per
//! pattern, validates and dispatches inbound NOM bodies, and owns its bindings and peerings.
//!
//! This module owns no network I/O — only the routing and bookkeeping policy. The driver
//! reactor (`driver` module) owns sockets and translates [`PeeringAction`]s returned here into
//! actual datagrams. Cyclic ownership note (`§9`): peerings are owned by value in a `HashMap`,
//! not shared via `Rc`, since nothing outside the vocket needs a handle to one.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::mpsc;

use log::warn;

use crate::binding::Binding;
use crate::peering::{Peering, PeeringAction};
use crate::socket_type::{PatternTraits, RoutingPolicy, SocketType};

/// One application-level message: usually a single frame, two for `ROUTER`
/// (`[identity, body]`). The identity frame is an inproc-pipe convention only — it is
/// prepended/stripped here, never carried in a NOM-1 wire frame, which always holds exactly
/// one opaque body (`§9`, Open Question (c)).
pub type Frames = Vec<Vec<u8>>;

/// The application-facing half of a vocket's inproc pipe.
pub struct VocketHandle {
    pub to_driver: mpsc::Sender<Frames>,
    pub from_driver: mpsc::Receiver<Frames>,
}

/// The outcome of routing one outbound application message.
#[derive(Debug, PartialEq, Eq)]
pub enum OutboundDispatch {
    /// Send `body` as a NOM to the peering keyed `peering_key`.
    SendNom { peering_key: String, body: Vec<u8> },
    /// Send `body` as a NOM to every peering key listed.
    SendNomToMany { peering_keys: Vec<String>, body: Vec<u8> },
    /// The message could not be routed; `reason` is logged and, where a peer exists to tell,
    /// surfaced as ROTFL.
    Reject { reason: &'static str },
}

/// The outcome of handling one inbound NOM body.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Deliver these frames to the application pipe.
    Deliver(Frames),
    /// Resend a cached reply without delivering the duplicate request to the application
    /// (REQ/REP idempotence, `§8`).
    Resend { peering_key: String, body: Vec<u8> },
    /// Drop the message; `reason` is logged at `warn!`.
    Drop(&'static str),
}

/// One virtual messaging socket.
pub struct Vocket {
    pub socket_type: SocketType,
    traits: PatternTraits,
    pub scheme: String,

    pub bindings: HashMap<SocketAddr, Binding>,
    pub peerings: HashMap<String, Peering>,
    /// The live peerings, in round-robin order: `next_round_robin` rotates this ring.
    live_order: VecDeque<String>,

    pub reply_to: Option<String>,
    /// The address of the most recent inbound sender, for `getmeta(handle, "sender")`.
    pub last_sender: Option<SocketAddr>,

    to_app: mpsc::Sender<Frames>,
    from_app: mpsc::Receiver<Frames>,
}

impl Vocket {
    /// Creates a vocket of `socket_type` bound to `scheme`, returning it paired with the
    /// application-facing handle to its inproc pipe.
    pub fn new(socket_type: SocketType, scheme: &str) -> (Self, VocketHandle) {
        let (to_driver, from_app) = mpsc::channel();
        let (to_app, from_driver) = mpsc::channel();

        let vocket = Self {
            socket_type,
            traits: socket_type.traits(),
            scheme: scheme.to_string(),
            bindings: HashMap::new(),
            peerings: HashMap::new(),
            live_order: VecDeque::new(),
            reply_to: None,
            last_sender: None,
            to_app,
            from_app,
        };

        (vocket, VocketHandle { to_driver, from_driver })
    }

    pub fn traits(&self) -> PatternTraits {
        self.traits
    }

    /// `true` once enough peerings are live that the application pipe should be drained
    /// (`§4.3`'s live-count backpressure rule).
    pub fn should_poll_pipe(&self) -> bool {
        if self.traits.min_peerings == 0 {
            true
        } else {
            self.live_order.len() >= self.traits.min_peerings
        }
    }

    /// Pulls the next outbound application message, if any is queued and the pipe should be
    /// polled.
    pub fn try_recv_outbound(&self) -> Option<Frames> {
        if !self.should_poll_pipe() {
            return None;
        }
        self.from_app.try_recv().ok()
    }

    /// Delivers inbound frames to the application.
    pub fn deliver_inbound(&self, frames: Frames) -> Result<(), mpsc::SendError<Frames>> {
        self.to_app.send(frames)
    }

    /// `None` if a new peering may be added; otherwise the ROTFL reason to send the would-be
    /// peer (`§4.4`).
    pub fn reject_reason_for_new_peering(&self) -> Option<&'static str> {
        if self.peerings.len() >= self.traits.max_peerings {
            Some("max peerings reached for socket")
        } else {
            None
        }
    }

    pub fn insert_peering(&mut self, peering: Peering) {
        self.peerings.insert(peering.key.clone(), peering);
    }

    pub fn remove_peering(&mut self, key: &str) -> Option<Peering> {
        self.mark_not_live(key);
        if self.reply_to.as_deref() == Some(key) {
            self.reply_to = None;
        }
        self.peerings.remove(key)
    }

    fn mark_live(&mut self, key: &str) {
        if !self.live_order.iter().any(|k| k == key) {
            self.live_order.push_back(key.to_string());
        }
    }

    fn mark_not_live(&mut self, key: &str) {
        self.live_order.retain(|k| k != key);
    }

    fn rekey_peering(&mut self, old_key: &str, new_key: String) {
        let Some(mut peering) = self.peerings.remove(old_key) else { return };
        peering.key = new_key.clone();
        // `on_ohai_ok` has already transitioned the peering itself to `Live` by the time a
        // focusing `Rekey` is returned, before `old_key` ever appears in `live_order`.
        // Liveness after rekeying is read off the peering's own state, not off whether
        // `old_key` was already live.
        let is_live = peering.is_live();

        self.mark_not_live(old_key);

        if self.reply_to.as_deref() == Some(old_key) {
            self.reply_to = Some(new_key.clone());
        }

        self.peerings.insert(new_key.clone(), peering);

        if is_live {
            self.mark_live(&new_key);
        }
    }

    /// Applies the map-bookkeeping side effects of a [`PeeringAction`] returned by
    /// `peering.tick()` / `on_ohai_ok()`; the caller separately matches on `action` to decide
    /// what bytes (if any) to send.
    pub fn apply_peering_action(&mut self, key: &str, action: &PeeringAction) {
        match action {
            PeeringAction::BecameLive => self.mark_live(key),
            PeeringAction::BecameSilent => self.mark_not_live(key),
            PeeringAction::Remove => {
                self.remove_peering(key);
            }
            PeeringAction::Rekey { old_key, new_key, .. } => self.rekey_peering(old_key, new_key.clone()),
            PeeringAction::None | PeeringAction::SendOhai { .. } | PeeringAction::SendOhaiOk { .. } | PeeringAction::SendHugz { .. } => {}
        }
    }

    fn next_round_robin(&mut self) -> Option<String> {
        let key = self.live_order.pop_front()?;
        self.live_order.push_back(key.clone());
        Some(key)
    }

    /// Routes one outbound application message, per the `§4.4` routing-policy table.
    pub fn dispatch_outbound(&mut self, mut frames: Frames) -> OutboundDispatch {
        match self.traits.routing {
            RoutingPolicy::None => OutboundDispatch::Reject { reason: "outbound not supported for this socket type" },

            RoutingPolicy::Request => {
                let Some(key) = self.next_round_robin() else {
                    return OutboundDispatch::Reject { reason: "no live peering" };
                };
                let body = frames.pop().unwrap_or_default();

                let Some(peering) = self.peerings.get_mut(&key) else {
                    return OutboundDispatch::Reject { reason: "peering vanished" };
                };
                if peering.request.is_some() {
                    warn!(target: "vocket", "{} send without recv", key);
                    return OutboundDispatch::Reject { reason: "send without recv" };
                }
                peering.request = Some(body.clone());
                peering.sequence = peering.sequence.wrapping_add(1) & 0x0F;

                OutboundDispatch::SendNom { peering_key: key, body }
            }

            RoutingPolicy::Reply => {
                let Some(key) = self.reply_to.take() else {
                    return OutboundDispatch::Reject { reason: "no pending request to reply to" };
                };
                let body = frames.pop().unwrap_or_default();

                if let Some(peering) = self.peerings.get_mut(&key) {
                    peering.reply = Some(body.clone());
                }

                OutboundDispatch::SendNom { peering_key: key, body }
            }

            RoutingPolicy::Dealer => {
                let Some(key) = self.next_round_robin() else {
                    return OutboundDispatch::Reject { reason: "no live peering" };
                };
                let body = frames.pop().unwrap_or_default();
                OutboundDispatch::SendNom { peering_key: key, body }
            }

            RoutingPolicy::Router => {
                if frames.len() < 2 {
                    return OutboundDispatch::Reject { reason: "router outbound requires an identity frame" };
                }
                let identity = String::from_utf8_lossy(&frames[0]).into_owned();
                let key = crate::addr::strip_scheme(&identity);
                let key = format!("{}://{}", self.scheme, key);
                let body = frames[1..].concat();

                match self.peerings.get(&key) {
                    Some(p) if p.is_live() => OutboundDispatch::SendNom { peering_key: key, body },
                    _ => OutboundDispatch::Reject { reason: "no live peering for router identity" },
                }
            }

            RoutingPolicy::Publish => {
                let keys: Vec<String> = self.live_order.iter().cloned().collect();
                let body = frames.pop().unwrap_or_default();
                OutboundDispatch::SendNomToMany { peering_keys: keys, body }
            }

            RoutingPolicy::Single => {
                let Some(key) = self.live_order.front().cloned() else {
                    return OutboundDispatch::Reject { reason: "no live peering" };
                };
                let body = frames.pop().unwrap_or_default();
                OutboundDispatch::SendNom { peering_key: key, body }
            }
        }
    }

    /// Handles one inbound NOM body, per the `§4.4` inbound-handling table.
    pub fn handle_nom(&mut self, peering_key: &str, frame_sequence: u8, body: Vec<u8>, source: SocketAddr) -> InboundOutcome {
        self.last_sender = Some(source);

        match self.socket_type {
            SocketType::Request => {
                if let Some(p) = self.peerings.get_mut(peering_key) {
                    p.request = None;
                }
                InboundOutcome::Deliver(vec![body])
            }

            SocketType::Reply => {
                let Some(p) = self.peerings.get_mut(peering_key) else {
                    return InboundOutcome::Drop("unknown peering");
                };

                if p.reply.is_some() && p.sequence == frame_sequence {
                    let cached = p.reply.clone().unwrap_or_default();
                    InboundOutcome::Resend { peering_key: peering_key.to_string(), body: cached }
                } else {
                    p.sequence = frame_sequence;
                    self.reply_to = Some(peering_key.to_string());
                    InboundOutcome::Deliver(vec![body])
                }
            }

            SocketType::Router => {
                let identity = format!("{}://{}", self.scheme, source).into_bytes();
                InboundOutcome::Deliver(vec![identity, body])
            }

            _ => {
                if self.traits.nomnom {
                    InboundOutcome::Deliver(vec![body])
                } else {
                    warn!(target: "vocket", "{:?} does not accept inbound, dropping", self.socket_type);
                    InboundOutcome::Drop("socket type does not accept inbound messages")
                }
            }
        }
    }
}
