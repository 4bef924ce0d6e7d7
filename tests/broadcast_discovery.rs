//! End-to-end scenario 4 (`SPEC_FULL.md` §8): broadcast discovery over UDP.
//!
//! A DEALER connects to the broadcast wildcard `udp://*:PORT`; the REP bound at the concrete
//! address responds; the DEALER reads a reply and `getmeta(handle, "sender")` reports the
//! responder's address.
//!
//! `§9`'s "Broadcast selection" design note calls enumerating interfaces and picking a subnet
//! broadcast address platform-specific, abstracted behind `BroadcastResolver` precisely so a
//! test can inject a fixed address instead — real `255.255.255.255` broadcast delivery is not
//! guaranteed to reach a same-host listener through every sandbox's loopback configuration, so
//! this test points the resolver at the concrete loopback address the REP binds to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vocket::config::{DriverConfig, FixedBroadcastResolver};
use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const PORT: u16 = 29104;
const ADDRESS: &str = "udp://127.0.0.1:29104";
const STEP_INTERVAL: Duration = Duration::from_millis(20);

#[test]
fn dealer_discovers_reply_over_broadcast_and_reads_sender_metadata() {
    let _ = env_logger::try_init();

    let server = thread::spawn(|| {
        let mut engine = Engine::new();
        engine.register("udp", Box::new(UdpDriver::new()));

        let rep = engine.new_socket(SocketType::Reply);
        engine.bind(rep, ADDRESS);
        let handle = engine.handle(rep).expect("socket exists");

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(request) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
                assert_eq!(request, vec![b"ICANHAZ?".to_vec()]);
                handle.to_driver.send(vec![b"CHEEZBURGER".to_vec()]).expect("application pipe open");
                return;
            }
        }
        panic!("[server] no request received within the test's bounded duration");
    });

    thread::sleep(STEP_INTERVAL * 4);

    let client = thread::spawn(move || {
        let mut config = DriverConfig::default();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        config.resolver = Arc::new(FixedBroadcastResolver(loopback));

        let mut engine = Engine::new();
        engine.register("udp", Box::new(UdpDriver::with_config(config)));

        let dealer = engine.new_socket(SocketType::Dealer);
        engine.connect(dealer, "udp://*:29104");
        let handle = engine.handle(dealer).expect("socket exists");

        let mut sent = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !sent && handle.to_driver.send(vec![b"ICANHAZ?".to_vec()]).is_ok() {
                sent = true;
            }
            if let Ok(reply) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
                assert_eq!(reply, vec![b"CHEEZBURGER".to_vec()]);
                let sender = engine.getmeta(dealer, "sender").expect("sender metadata available");
                assert_eq!(sender.parse::<SocketAddr>().unwrap().port(), PORT);
                return;
            }
        }
        panic!("[dealer] no reply received within the test's bounded duration");
    });

    client.join().expect("dealer thread panicked");
    server.join().expect("server thread panicked");
}
