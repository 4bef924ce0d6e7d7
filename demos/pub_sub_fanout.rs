//! A PUBLISH/SUBSCRIBE fan-out demo over UDP: one publisher, two subscribers, each subscriber
//! independently receiving every message the publisher sends. Same bounded-duration,
//! nonzero-on-assertion-failure shape as `req_rep_echo` (`SPEC_FULL.md` §6).

use std::thread;
use std::time::Duration;

use vocket::driver::udp::UdpDriver;
use vocket::{Engine, SocketType};

const ADDRESS: &str = "udp://127.0.0.1:28512";
const STEP_INTERVAL: Duration = Duration::from_millis(30);
const MESSAGE_COUNT: usize = 5;

fn publisher_thread() {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::new()));

    let pub_socket = engine.new_socket(SocketType::Publish);
    engine.bind(pub_socket, ADDRESS);
    let handle = engine.handle(pub_socket).expect("socket exists");

    // Give both subscribers time to OHAI in before the first publish.
    thread::sleep(STEP_INTERVAL * 6);

    for i in 0..MESSAGE_COUNT {
        let body = format!("tick-{}", i).into_bytes();
        handle.to_driver.send(vec![body]).expect("application pipe open");
        println!("[publisher] sent tick-{}", i);
        thread::sleep(STEP_INTERVAL);
    }

    // Keep the reactor alive long enough for the last publish to actually reach the wire.
    thread::sleep(STEP_INTERVAL * 6);
}

fn subscriber_thread(name: &'static str) -> Vec<String> {
    let mut engine = Engine::new();
    engine.register("udp", Box::new(UdpDriver::new()));

    let sub = engine.new_socket(SocketType::Subscribe);
    engine.connect(sub, ADDRESS);
    let handle = engine.handle(sub).expect("socket exists");

    let mut received = Vec::new();
    let deadline = std::time::Instant::now() + STEP_INTERVAL * 20;
    while received.len() < MESSAGE_COUNT && std::time::Instant::now() < deadline {
        if let Ok(frames) = handle.from_driver.recv_timeout(STEP_INTERVAL) {
            let text = String::from_utf8_lossy(&frames[0]).into_owned();
            println!("[{}] received {:?}", name, text);
            received.push(text);
        }
    }

    received
}

fn main() {
    let publisher = thread::spawn(publisher_thread);
    thread::sleep(STEP_INTERVAL * 2);

    let sub_a = thread::spawn(|| subscriber_thread("subscriber-a"));
    let sub_b = thread::spawn(|| subscriber_thread("subscriber-b"));

    let received_a = sub_a.join().expect("subscriber-a panicked");
    let received_b = sub_b.join().expect("subscriber-b panicked");
    publisher.join().expect("publisher panicked");

    assert_eq!(received_a.len(), MESSAGE_COUNT, "subscriber-a missed messages");
    assert_eq!(received_b.len(), MESSAGE_COUNT, "subscriber-b missed messages");

    println!("pub/sub fan-out reached both subscribers");
}
