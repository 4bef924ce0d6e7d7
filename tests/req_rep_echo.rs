//! End-to-end scenario 1 (`SPEC_FULL.md` §8): REQUEST/REPLY echo over UDP.
//!
//! Grounded in `uflow`'s `tests/disconnect.rs` shape: a server thread and a client thread, each
//! built with `std::thread::spawn`, polling `recv_timeout` against a wall-clock deadline,
//! asserting on what was observed, joined at the end.

use std::thread;
use std::time::{Duration, Instant};

use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const ADDRESS: &str = "udp://127.0.0.1:29101";
const STEP_INTERVAL: Duration = Duration::from_millis(20);
const DURATION: Duration = Duration::from_secs(2);

#[test]
fn req_rep_echo_round_trip() {
    let _ = env_logger::try_init();

    let server = thread::spawn(|| {
        let mut engine = Engine::new();
        engine.register("udp", Box::new(UdpDriver::new()));

        let rep = engine.new_socket(SocketType::Reply);
        engine.bind(rep, ADDRESS);
        let handle = engine.handle(rep).expect("socket exists");

        let deadline = Instant::now() + DURATION;
        while Instant::now() < deadline {
            if let Ok(request) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
                assert_eq!(request, vec![b"ICANHAZ?".to_vec()]);
                handle.to_driver.send(vec![b"CHEEZBURGER".to_vec()]).expect("application pipe open");
                return;
            }
        }
        panic!("[server] no request received within the test's bounded duration");
    });

    // Give the REP binding time to come up before the REQ side starts OHAIing it.
    thread::sleep(STEP_INTERVAL * 4);

    let client = thread::spawn(|| {
        let mut engine = Engine::new();
        engine.register("udp", Box::new(UdpDriver::new()));

        let req = engine.new_socket(SocketType::Request);
        engine.connect(req, ADDRESS);
        let handle = engine.handle(req).expect("socket exists");

        let mut sent = false;
        let deadline = Instant::now() + DURATION;
        while Instant::now() < deadline {
            if !sent && handle.to_driver.send(vec![b"ICANHAZ?".to_vec()]).is_ok() {
                sent = true;
            }
            if let Ok(reply) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
                assert_eq!(reply, vec![b"CHEEZBURGER".to_vec()]);
                return;
            }
        }
        panic!("[client] no reply received within the test's bounded duration");
    });

    client.join().expect("client thread panicked");
    server.join().expect("server thread panicked");
}
