//! Clock drift between sender and receiver
//!
//! The receiver pulls one packet's worth per tick. A sender running fast or
//! slow shows up as a growing or shrinking backlog, which the DLL answers
//! with a rate correction.

use mediasync_engine::{PullOutcome, RtpHeader, RtpReceiver, StreamConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

const STRIDE: u32 = 4;
const SSRC: u32 = 0xd1f7_0000;
const PACKET: u32 = 128;
const TARGET: u32 = 512;

fn receiver() -> RtpReceiver {
    let config = StreamConfig {
        ring_size: (8192 * STRIDE) as usize,
        packet_samples: PACKET,
        target_occupancy: TARGET,
        ts_offset: 0,
        ..StreamConfig::new(48000, STRIDE)
    };
    RtpReceiver::new(config).unwrap()
}

/// Produces contiguous packets whose frames hold their timestamp
struct Source {
    seq: u16,
    timestamp: u32,
}

impl Source {
    fn new() -> Self {
        Source { seq: 7, timestamp: 90_000 }
    }

    fn next_packet(&mut self) -> Vec<u8> {
        let mut packet = RtpHeader::new(127, self.seq, self.timestamp, SSRC)
            .serialize()
            .to_vec();
        for frame in 0..PACKET {
            packet.extend_from_slice(&self.timestamp.wrapping_add(frame).to_le_bytes());
        }
        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(PACKET);
        packet
    }
}

fn pull(rx: &mut RtpReceiver) -> Vec<u8> {
    let mut out = vec![0u8; (PACKET * STRIDE) as usize];
    match rx.playback_pull(&mut out, None) {
        PullOutcome::Played { samples, .. } => assert_eq!(samples, PACKET),
        other => panic!("unexpected pull outcome {:?}", other),
    }
    out
}

fn first_frame(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[test]
fn test_matched_clocks_need_no_correction() {
    let mut rx = receiver();
    let mut source = Source::new();

    for _ in 0..300 {
        rx.receive_packet(&source.next_packet()).unwrap();
        pull(&mut rx);
    }

    assert_eq!(rx.correction(), 1.0);
    assert_eq!(rx.rate_match(), Some(1.0));
    assert_eq!(rx.stats().resyncs, 1);
    assert_eq!(rx.stats().underruns, 0);
}

#[test]
fn test_fast_sender_speeds_up_playback() {
    let mut rx = receiver();
    let mut source = Source::new();

    for tick in 0..400 {
        rx.receive_packet(&source.next_packet()).unwrap();
        if tick % 50 == 49 {
            rx.receive_packet(&source.next_packet()).unwrap();
        }
        pull(&mut rx);
    }

    // backlog grew by eight packets and is still below the overrun guard
    let (avail, _) = rx.ring().get_read_index();
    assert_eq!(avail as u32, TARGET - PACKET + 8 * PACKET);
    assert_eq!(rx.stats().overruns, 0);
    assert!(rx.correction() > 1.0);
    assert!(rx.rate_match().unwrap() < 1.0);
    assert!(rx.correction() <= 1.05);
}

#[test]
fn test_slow_sender_slows_down_playback() {
    let mut rx = receiver();
    let mut source = Source::new();

    for tick in 0..200 {
        if tick % 60 != 59 {
            rx.receive_packet(&source.next_packet()).unwrap();
        }
        pull(&mut rx);
    }

    assert_eq!(rx.stats().underruns, 0);
    assert_eq!(rx.stats().resyncs, 1);
    assert!(rx.correction() < 1.0);
    assert!(rx.rate_match().unwrap() > 1.0);
    assert!(rx.correction() >= 0.95);
}

#[test]
fn test_bursty_arrival_plays_without_gaps() {
    let mut rx = receiver();
    let mut source = Source::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut in_flight = VecDeque::new();

    rx.receive_packet(&source.next_packet()).unwrap();
    // the anchor leaves silence ahead of the first packet
    assert_eq!(first_frame(&pull(&mut rx)), 0);
    let mut expected = None;

    for _ in 0..500 {
        in_flight.push_back(source.next_packet());
        // never more than two packets late
        let deliver = if in_flight.len() >= 3 {
            in_flight.len()
        } else {
            rng.gen_range(0..=in_flight.len())
        };
        for packet in in_flight.drain(..deliver) {
            rx.receive_packet(&packet).unwrap();
        }

        let frame = first_frame(&pull(&mut rx));
        match expected {
            Some(next) => assert_eq!(frame, next),
            None if frame == 0 => continue,
            None => assert_eq!(frame, 90_000),
        }
        expected = Some(frame + PACKET);
    }
    assert!(expected.is_some());

    assert_eq!(rx.stats().resyncs, 1);
    assert_eq!(rx.stats().packets_lost, 0);
    assert_eq!(rx.stats().underruns, 0);
    assert!((0.95..=1.05).contains(&rx.correction()));
}
