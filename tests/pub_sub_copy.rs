//! End-to-end scenario 3 (`SPEC_FULL.md` §8): PUBLISH/SUBSCRIBE copy over UDP.
//!
//! One PUB bound, two SUB connected; every message the PUB produces must reach both SUBs. See
//! `push_pull_fanout.rs` for why the PUB side uses a short `ohai_ivl`: it is the accepting side
//! of each peering, so its own liveness flip depends on that interval.

use std::thread;
use std::time::{Duration, Instant};

use vocket::config::DriverConfig;
use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const ADDRESS: &str = "udp://127.0.0.1:29103";
const STEP_INTERVAL: Duration = Duration::from_millis(20);
const MESSAGE_COUNT: usize = 5;

fn fast_handshake_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.ohai_ivl = Duration::from_millis(30);
    config.timeout = Duration::from_millis(800);
    config
}

fn subscriber_thread() -> Vec<String> {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::with_config(fast_handshake_config())));

    let sub = engine.new_socket(SocketType::Subscribe);
    engine.connect(sub, ADDRESS);
    let handle = engine.handle(sub).expect("socket exists");

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.len() < MESSAGE_COUNT && Instant::now() < deadline {
        if let Ok(frames) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
            received.push(String::from_utf8_lossy(&frames[0]).into_owned());
        }
    }
    received
}

#[test]
fn pub_sub_delivers_every_message_to_every_subscriber() {
    let _ = env_logger::try_init();

    let mut pub_engine = Engine::new();
    pub_engine.register("udp", Box::new(UdpDriver::with_config(fast_handshake_config())));
    let publisher = pub_engine.new_socket(SocketType::Publish);
    pub_engine.bind(publisher, ADDRESS);

    let sub_a = thread::spawn(subscriber_thread);
    let sub_b = thread::spawn(subscriber_thread);

    thread::sleep(Duration::from_millis(300));

    {
        let handle = pub_engine.handle(publisher).expect("socket exists");
        for i in 0..MESSAGE_COUNT {
            let body = format!("tick-{}", i).into_bytes();
            handle.to_driver.send(vec![body]).expect("application pipe open");
            thread::sleep(STEP_INTERVAL);
        }
    }

    let received_a = sub_a.join().expect("subscriber-a panicked");
    let received_b = sub_b.join().expect("subscriber-b panicked");

    let expected: Vec<String> = (0..MESSAGE_COUNT).map(|i| format!("tick-{}", i)).collect();
    assert_eq!(received_a, expected);
    assert_eq!(received_b, expected);
}
