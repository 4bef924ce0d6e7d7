#![warn(missing_docs)]

//! `vocket` is a virtual transport layer providing brokerless messaging sockets — request/reply,
//! router/dealer, publish/subscribe, push/pull, and pair — emulated over UDP and TCP. Peers
//! discover and track each other through an in-band control protocol (NOM-1) carried inside the
//! same datagrams or stream as application traffic; there is no broker process and no separate
//! discovery channel.
//!
//! # Creating sockets
//!
//! An [`Engine`] owns the registry of transport drivers and is created once per process:
//!
//! ```no_run
//! use vocket::{Engine, SocketType};
//! use vocket::driver::udp::UdpDriver;
//!
//! let mut engine = Engine::new();
//! engine.register("udp", Box::new(UdpDriver::new()));
//!
//! let rep = engine.new_socket(SocketType::Reply);
//! engine.bind(rep, "udp://*:32000");
//! ```
//!
//! # Sending and receiving
//!
//! Application code talks to a socket through the [`VocketHandle`] returned by
//! [`Engine::handle`]; it is a plain in-process pipe carrying single-frame (or, for `ROUTER`,
//! two-frame) message vectors, independent of whatever the driver does on the wire.
//!
//! # Closing a socket
//!
//! [`Engine::close`] tears down a socket's bindings and peerings; dropping the `Engine` shuts
//! down every registered driver in turn.

mod addr;
mod binding;
mod codec;
pub mod config;
pub mod driver;
mod engine;
mod error;
mod nom1;
mod peering;
mod ring_queue;
mod socket_type;
mod vocket;

pub use addr::{BroadcastResolver, DefaultBroadcastResolver, Endpoint};
pub use codec::{Codec, CodecError, DEFAULT_VSM_CUTOFF};
pub use config::{DriverConfig, FixedBroadcastResolver};
pub use driver::Counters;
pub use engine::Engine;
pub use error::{ConfigErrorKind, Error, ReplyCode};
pub use nom1::{Command as Nom1Command, DecodeError as Nom1DecodeError, Frame as Nom1Frame, VERSION as NOM1_VERSION};
pub use peering::{Peering, PeeringAction, PeeringState};
pub use ring_queue::RingQueue;
pub use socket_type::{PatternTraits, RoutingPolicy, SocketType, DEFAULT_MAX_PEERINGS};
pub use vocket::{Frames, InboundOutcome, OutboundDispatch, Vocket, VocketHandle};

pub use driver::VocketId;
