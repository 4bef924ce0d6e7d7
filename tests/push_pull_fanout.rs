//! End-to-end scenario 2 (`SPEC_FULL.md` §8): PUSH/PULL fan-out over UDP.
//!
//! One PUSH bound, two PULL connected; ten messages are round-robined across the two PULLs.
//! Loopback UDP in a test process drops essentially nothing, so this asserts the PUSH/PULL
//! exact-partition property scenario 2 describes ("each PULL eventually receives at least one;
//! the sum of received counts equals sent") rather than the looser "minus lost-to-UDP" bound
//! the design allows for a real, lossy network.
//!
//! PUSH is the bound (accepting) side here, so its own peerings only flip from `CONNECTING` to
//! `LIVE` once the bidirectional OHAI/OHAI-OK exchange `§4.3` describes completes on both ends
//! (the acceptor resends OHAI on its own `ohai_ivl` tick, same as an outgoing peering would).
//! A short `ohai_ivl` keeps that handshake, and so this test, fast and deterministic.

use std::thread;
use std::time::{Duration, Instant};

use vocket::config::DriverConfig;
use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const ADDRESS: &str = "udp://127.0.0.1:29102";
const STEP_INTERVAL: Duration = Duration::from_millis(20);
const MESSAGE_COUNT: usize = 10;

fn fast_handshake_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.ohai_ivl = Duration::from_millis(30);
    config.timeout = Duration::from_millis(800);
    config
}

fn pull_thread() -> Vec<String> {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::with_config(fast_handshake_config())));

    let pull = engine.new_socket(SocketType::Pull);
    engine.connect(pull, ADDRESS);
    let handle = engine.handle(pull).expect("socket exists");

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(frames) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
            received.push(String::from_utf8_lossy(&frames[0]).into_owned());
        }
    }
    received
}

#[test]
fn push_pull_fans_out_round_robin_across_both_pulls() {
    let _ = env_logger::try_init();

    let mut push_engine = Engine::new();
    push_engine.register("udp", Box::new(UdpDriver::with_config(fast_handshake_config())));
    let push = push_engine.new_socket(SocketType::Push);
    push_engine.bind(push, ADDRESS);

    let pull_a = thread::spawn(pull_thread);
    let pull_b = thread::spawn(pull_thread);

    // Give both PULLs' OHAI handshake, and PUSH's own acceptor-side liveness flip, time to land.
    thread::sleep(Duration::from_millis(300));

    {
        let handle = push_engine.handle(push).expect("socket exists");
        for i in 0..MESSAGE_COUNT {
            let body = format!("NOM {:04}", i).into_bytes();
            handle.to_driver.send(vec![body]).expect("application pipe open");
            thread::sleep(STEP_INTERVAL);
        }
    }

    let received_a = pull_a.join().expect("pull-a thread panicked");
    let received_b = pull_b.join().expect("pull-b thread panicked");

    assert!(!received_a.is_empty(), "pull-a received nothing");
    assert!(!received_b.is_empty(), "pull-b received nothing");
    assert_eq!(received_a.len() + received_b.len(), MESSAGE_COUNT);
}
