//! Binding (C5): one locally listening endpoint per vocket, owning exactly one network handle.
//!
//! Grounded in `uflow`'s `udp_frame_sink::UdpFrameSink`, which pairs a `UdpSocket` with the
//! bookkeeping its owner needs — here, a binding's handle is a `mio::net::UdpSocket` registered
//! with the driver's `Poll`, since the reactor (`§4.6`) is built on `mio` rather than
//! `uflow`'s own I/O layer.

use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::Token;

/// One locally bound endpoint. Destroyed when its owning vocket is destroyed.
pub struct Binding {
    pub local: SocketAddr,
    pub socket: UdpSocket,
    /// The `mio` registration token this binding's socket is polled under.
    pub token: Token,
}

impl Binding {
    pub fn new(local: SocketAddr, socket: UdpSocket, token: Token) -> Self {
        Self { local, socket, token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_retains_its_local_address_and_token() {
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        let binding = Binding::new(local, socket, Token(7));

        assert_eq!(binding.local, local);
        assert_eq!(binding.token, Token(7));
    }
}
