//! A REQUEST/REPLY echo demo over UDP, in the shape of `uflow/examples/echo_client.rs` and
//! `echo_server.rs`: one thread per role, `println!`s for each event, a fixed address instead of
//! ephemeral binding. Unlike `uflow`'s own examples (which loop forever as standalone programs),
//! this binary runs for a bounded duration and exits 0 on a clean echo round trip, nonzero (via
//! an unwound `assert_eq!`) if the reply doesn't match (`SPEC_FULL.md` §6).

use std::thread;
use std::time::Duration;

use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const ADDRESS: &str = "udp://127.0.0.1:28511";
const STEP_INTERVAL: Duration = Duration::from_millis(30);
const DURATION: Duration = Duration::from_secs(2);

fn server_thread() {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::new()));

    let rep = engine.new_socket(SocketType::Reply);
    engine.bind(rep, ADDRESS);
    let handle = engine.handle(rep).expect("socket exists");
    let deadline = std::time::Instant::now() + DURATION;
    while std::time::Instant::now() < deadline {
        if let Ok(request) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
            let text = String::from_utf8_lossy(&request[0]).into_owned();
            println!("[server] received {:?}", text);
            let reply = text.chars().rev().collect::<String>();
            handle.to_driver.send(vec![reply.into_bytes()]).expect("application pipe open");
        }
    }
}

fn client_thread() {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::new()));

    let req = engine.new_socket(SocketType::Request);
    engine.connect(req, ADDRESS);

    let handle = engine.handle(req).expect("socket exists");

    let deadline = std::time::Instant::now() + DURATION;
    let mut sent = false;
    let mut echoed = None;

    while std::time::Instant::now() < deadline && echoed.is_none() {
        if !sent {
            if handle.to_driver.send(vec![b"CHEEZBURGER".to_vec()]).is_ok() {
                sent = true;
                println!("[client] sent \"CHEEZBURGER\"");
            }
        }

        if let Ok(reply) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
            let text = String::from_utf8_lossy(&reply[0]).into_owned();
            println!("[client] received {:?}", text);
            echoed = Some(text);
        } else if sent {
            thread::sleep(STEP_INTERVAL);
        }
    }

    let echoed = echoed.expect("no reply received within the demo's bounded duration");
    assert_eq!(echoed, "REGRUBZEEHC");
}

fn main() {
    let server = thread::spawn(server_thread);
    thread::sleep(STEP_INTERVAL * 4);

    let client = thread::spawn(client_thread);
    client.join().expect("client thread panicked");
    server.join().expect("server thread panicked");

    println!("req/rep echo round trip succeeded");
}
