//! Stream synchronization scenarios
//!
//! Drives an `RtpReceiver` with hand-built packets and checks anchoring,
//! gap recovery and steady-state behavior.

use mediasync_engine::{
    EngineError, PullOutcome, ReceiveOutcome, RtpHeader, RtpReceiver, StreamConfig,
};

const STRIDE: u32 = 4;
const SSRC: u32 = 0x5eed_0001;

fn receiver(capacity: u32, target: u32) -> RtpReceiver {
    let config = StreamConfig {
        ring_size: (capacity * STRIDE) as usize,
        target_occupancy: target,
        packet_samples: 128,
        ts_offset: 0,
        ..StreamConfig::new(48000, STRIDE)
    };
    RtpReceiver::new(config).unwrap()
}

fn create_test_packet(seq: u16, timestamp: u32, samples: u32) -> Vec<u8> {
    let mut packet = RtpHeader::new(127, seq, timestamp, SSRC).serialize().to_vec();
    // frame n carries the low byte of its timestamp
    for frame in 0..samples {
        let value = (timestamp.wrapping_add(frame) as u8).max(1);
        packet.extend_from_slice(&[value; STRIDE as usize]);
    }
    packet
}

#[test]
fn test_first_packet_anchor_scenario() {
    let mut rx = receiver(4096, 512);
    rx.receive_packet(&create_test_packet(0, 1000, 1024)).unwrap();

    let cursors = rx.ring().cursors();
    assert_eq!(cursors.read_index(), 1000);
    // anchored at 1000 + 512, then the 1024 frames were appended
    assert_eq!(cursors.write_index(), 1512 + 1024);

    let mut out = vec![0u8; (128 * STRIDE) as usize];
    match rx.playback_pull(&mut out, None) {
        PullOutcome::Played { samples, skipped } => {
            assert_eq!(samples, 128);
            // leading silence plus the first 512 frames of the packet
            assert_eq!(skipped, 1024);
        }
        other => panic!("unexpected pull outcome {:?}", other),
    }
    // playback resumes 512 frames into the packet
    assert_eq!(out[0], (1000u32 + 512) as u8);
    let (avail, _) = rx.ring().get_read_index();
    assert_eq!(avail, 512 - 128);
}

#[test]
fn test_steady_stream_converges() {
    let mut rx = receiver(8192, 512);
    let mut out = vec![0u8; (128 * STRIDE) as usize];

    for seq in 0..500u16 {
        let outcome = rx.receive_packet(&create_test_packet(seq, seq as u32 * 128, 128)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Written { samples: 128 });
        assert!(rx.state().have_sync);
        assert!(matches!(rx.playback_pull(&mut out, None), PullOutcome::Played { .. }));
    }

    assert!((rx.correction() - 1.0).abs() < 1e-4);
    assert_eq!(rx.stats().resyncs, 1);
    assert_eq!(rx.stats().underruns, 0);
}

#[test]
fn test_single_loss_forces_resync_with_silence() {
    let mut rx = receiver(8192, 512);
    let mut out = vec![0u8; (128 * STRIDE) as usize];

    for seq in 0..10u16 {
        rx.receive_packet(&create_test_packet(seq, seq as u32 * 128, 128)).unwrap();
        rx.playback_pull(&mut out, None);
    }

    // sequence 10 never arrives
    rx.receive_packet(&create_test_packet(11, 11 * 128, 128)).unwrap();
    assert_eq!(rx.stats().resyncs, 2);
    assert_eq!(rx.stats().packets_lost, 1);
    assert!(rx.state().have_sync);

    // the new anchor sits 512 frames behind the packet, all silent
    let (avail, read_index) = rx.ring().get_read_index();
    assert_eq!(read_index, 11 * 128);
    assert_eq!(avail, 512 + 128);
    let mut head = vec![0xffu8; (128 * STRIDE) as usize];
    rx.playback_pull(&mut head, None);
    assert!(head.iter().all(|b| *b == 0));
}

#[test]
fn test_resync_twice_is_stable() {
    let mut rx = receiver(4096, 256);
    rx.receive_packet(&create_test_packet(0, 0, 128)).unwrap();

    rx.resync(9000);
    let once = rx.ring().cursors();
    rx.resync(9000);
    let twice = rx.ring().cursors();
    assert_eq!(once, twice);

    let mut out = vec![0xffu8; (256 * STRIDE) as usize];
    assert!(matches!(rx.playback_pull(&mut out, None), PullOutcome::Played { .. }));
    assert!(out.iter().all(|b| *b == 0));
}

#[test]
fn test_foreign_and_malformed_packets_leave_state() {
    let mut rx = receiver(4096, 256);
    rx.receive_packet(&create_test_packet(0, 0, 128)).unwrap();
    let state = *rx.state();
    let cursors = rx.ring().cursors();

    let mut foreign = RtpHeader::new(127, 1, 128, 0x0bad_0bad).serialize().to_vec();
    foreign.extend_from_slice(&[1u8; 512]);
    assert!(matches!(
        rx.receive_packet(&foreign),
        Err(EngineError::UnexpectedSource { got: 0x0bad_0bad, .. })
    ));
    assert!(matches!(rx.receive_packet(&[0u8; 5]), Err(EngineError::MalformedPacket(_))));

    assert_eq!(*rx.state(), state);
    assert_eq!(rx.ring().cursors(), cursors);
    assert_eq!(rx.stats().packets_rejected, 2);
}
