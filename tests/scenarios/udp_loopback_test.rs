//! Sender and receiver talking over a real UDP socket on localhost

use mediasync_engine::{
    PullOutcome, RtpReceiver, RtpSender, StreamConfig, UdpTransport, MAX_PACKET_SIZE,
};
use std::time::Duration;
use tokio::time::timeout;

const STRIDE: u32 = 4;
const PACKET_SAMPLES: u32 = 128;

fn stream_config(target: u32) -> StreamConfig {
    StreamConfig {
        ring_size: (4096 * STRIDE) as usize,
        packet_samples: PACKET_SAMPLES,
        target_occupancy: target,
        ssrc: 0x0bad_f00d,
        ts_offset: 0x1000_0000,
        ..StreamConfig::new(48000, STRIDE)
    }
}

/// Each frame holds its own index so playback order can be checked
fn counting_frames(start: u32, count: u32) -> Vec<u8> {
    (start..start + count).flat_map(|n| n.to_le_bytes()).collect()
}

fn frame_at(data: &[u8], frame: usize) -> u32 {
    let at = frame * STRIDE as usize;
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[tokio::test]
async fn test_stream_over_loopback() {
    let rx_socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let rx_addr = rx_socket.local_addr().unwrap();
    let mut tx_socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Some(rx_addr))
        .await
        .unwrap();
    let tx_addr = tx_socket.local_addr().unwrap();

    let mut sender = RtpSender::new(stream_config(256)).unwrap();
    let mut receiver = RtpReceiver::new(stream_config(256)).unwrap();

    sender.capture(&counting_frames(0, 4 * PACKET_SAMPLES), None).unwrap();
    assert_eq!(sender.flush_packets(&mut tx_socket).unwrap(), 4);

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    for _ in 0..4 {
        let (packet, from) = timeout(Duration::from_secs(2), rx_socket.recv(&mut buf))
            .await
            .expect("datagram did not arrive")
            .unwrap();
        assert_eq!(from, tx_addr);
        receiver.receive_packet(packet).unwrap();
    }

    let state = receiver.state();
    assert!(state.have_sync);
    assert_eq!(state.ssrc, 0x0bad_f00d);
    assert_eq!(receiver.stats().packets_received, 4);
    assert_eq!(receiver.stats().packets_lost, 0);
    assert_eq!(receiver.stats().bytes_received, sender.stats().bytes_sent);

    let mut out = vec![0u8; (PACKET_SAMPLES * STRIDE) as usize];
    match receiver.playback_pull(&mut out, None) {
        PullOutcome::Played { samples, skipped } => {
            assert_eq!(samples, PACKET_SAMPLES);
            assert_eq!(skipped, 512);
        }
        other => panic!("unexpected pull outcome {:?}", other),
    }
    // the excess was skipped, leaving exactly the target behind the read
    assert_eq!(frame_at(&out, 0), 256);
    assert_eq!(frame_at(&out, 127), 383);

    receiver.playback_pull(&mut out, None);
    assert_eq!(frame_at(&out, 0), 384);
}

#[tokio::test]
async fn test_foreign_sender_is_ignored() {
    let rx_socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let rx_addr = rx_socket.local_addr().unwrap();
    let mut first = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Some(rx_addr))
        .await
        .unwrap();
    let mut second = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Some(rx_addr))
        .await
        .unwrap();

    let mut owner = RtpSender::new(stream_config(256)).unwrap();
    let mut intruder = RtpSender::new(StreamConfig {
        ssrc: 0x1234_5678,
        ..stream_config(256)
    })
    .unwrap();
    let mut receiver = RtpReceiver::new(stream_config(256)).unwrap();

    owner.capture(&counting_frames(0, PACKET_SAMPLES), None).unwrap();
    owner.flush_packets(&mut first).unwrap();

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let (packet, _) = timeout(Duration::from_secs(2), rx_socket.recv(&mut buf))
        .await
        .expect("datagram did not arrive")
        .unwrap();
    receiver.receive_packet(packet).unwrap();
    let before = *receiver.state();

    intruder.capture(&counting_frames(0, PACKET_SAMPLES), None).unwrap();
    intruder.flush_packets(&mut second).unwrap();

    let (packet, _) = timeout(Duration::from_secs(2), rx_socket.recv(&mut buf))
        .await
        .expect("datagram did not arrive")
        .unwrap();
    assert!(receiver.receive_packet(packet).is_err());
    assert_eq!(*receiver.state(), before);
    assert_eq!(receiver.stats().packets_rejected, 1);
}
