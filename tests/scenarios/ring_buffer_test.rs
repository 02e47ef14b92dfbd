//! Ring buffer scenario tests
//!
//! Random interleavings of writes and reads, starting close to the 32-bit
//! cursor wrap, must return the written bytes in order.

use mediasync_engine::RingBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

const CAPACITY: usize = 256;

fn run_sequence(seed: u64, start: u32) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ring = RingBuffer::new(CAPACITY).unwrap();
    ring.set_indices(start, start);

    let mut expected: VecDeque<u8> = VecDeque::new();
    let mut next_byte: u8 = 0;

    for _ in 0..2000 {
        let (filled, write_index) = ring.get_write_index();
        assert!(filled >= 0 && filled as usize <= CAPACITY, "filled out of range: {}", filled);

        if rng.gen_bool(0.5) {
            let free = CAPACITY - filled as usize;
            let len = rng.gen_range(0..=free);
            let data: Vec<u8> = (0..len)
                .map(|_| {
                    next_byte = next_byte.wrapping_add(1);
                    next_byte
                })
                .collect();
            ring.write_data(&data, ring.byte_offset(write_index, 1));
            ring.write_update(write_index.wrapping_add(len as u32));
            expected.extend(data);
        } else {
            let (avail, read_index) = ring.get_read_index();
            let len = rng.gen_range(0..=avail as usize);
            let mut out = vec![0u8; len];
            ring.read_data(&mut out, ring.byte_offset(read_index, 1));
            ring.read_update(read_index.wrapping_add(len as u32));

            let want: Vec<u8> = expected.drain(..len).collect();
            assert_eq!(out, want);
        }
    }

    let (avail, _) = ring.get_read_index();
    assert_eq!(avail as usize, expected.len());
}

#[test]
fn test_round_trip_from_zero() {
    run_sequence(1, 0);
}

#[test]
fn test_round_trip_across_counter_overflow() {
    for seed in 2..6 {
        run_sequence(seed, u32::MAX - 300);
    }
}

#[test]
fn test_slices_cover_wrapped_region() {
    let mut ring = RingBuffer::new(16).unwrap();
    let data: Vec<u8> = (1..=10).collect();
    ring.write_data(&data, 12);

    let (first, second) = ring.slices(12, 10);
    assert_eq!(first, &data[..4]);
    assert_eq!(second, &data[4..]);
}
