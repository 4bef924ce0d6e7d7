//! End-to-end scenario 5 (`SPEC_FULL.md` §8): the codec self-test.
//!
//! Grounded in `frame/serial/mod.rs`'s `rand::random` round-trip test style (`connect_random`,
//! `data_random`): fill a codec with random messages (80% at or below the VSM cutoff, 20%
//! larger) until `put` fails, pipe its output through `bin_get`/`bin_tick` into a second
//! codec's `bin_put`, then drain the second codec and check the extracted sequence matches the
//! inserted one exactly, with both codecs' `active()` back to zero.

use rand::Rng;

use vocket::{Codec, DEFAULT_VSM_CUTOFF};

const BATCH_SLOTS: usize = 100;
const BYTE_CAPACITY: usize = 1 << 20;

#[test]
fn codec_self_test_round_trips_through_a_second_codec() {
    let mut rng = rand::thread_rng();

    let mut src = Codec::new(BATCH_SLOTS, BYTE_CAPACITY);
    let mut inserted: Vec<(Vec<u8>, bool)> = Vec::new();

    loop {
        let large = rng.gen_ratio(1, 5);
        let size = if large {
            rng.gen_range(DEFAULT_VSM_CUTOFF..DEFAULT_VSM_CUTOFF + 512)
        } else {
            rng.gen_range(0..DEFAULT_VSM_CUTOFF)
        };
        let body: Vec<u8> = (0..size).map(|_| rng.gen::<u8>()).collect();
        let more = rng.gen::<bool>();

        match src.put(&body, more) {
            Ok(()) => inserted.push((body, more)),
            Err(_) => break,
        }
    }

    assert!(!inserted.is_empty(), "expected at least one message to fit before exhaustion");

    let mut dst = Codec::new(BATCH_SLOTS, BYTE_CAPACITY);
    loop {
        let chunk = src.bin_get();
        if chunk.is_empty() {
            break;
        }
        let chunk = chunk.to_vec();
        let n = chunk.len();
        dst.bin_put(&chunk).expect("dst codec has matching capacity");
        src.bin_tick(n);
    }

    assert_eq!(src.active(), 0);

    let mut extracted: Vec<(Vec<u8>, bool)> = Vec::new();
    loop {
        let mut body = Vec::new();
        let mut more = false;
        if !dst.get(&mut body, &mut more) {
            break;
        }
        extracted.push((body, more));
    }

    assert_eq!(extracted.len(), inserted.len());
    assert_eq!(extracted, inserted);
    assert_eq!(dst.active(), 0);
}
