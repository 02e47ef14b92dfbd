//! RTP stream synchronization
//!
//! [`RtpReceiver`] turns inbound packets into a steady playback stream: it
//! anchors the ring buffer `target_occupancy` samples behind the freshest
//! packet, recovers from gaps and overruns by resynchronizing, and feeds the
//! occupancy error into a [`Dll`] so the host can rate-match against the
//! remote clock.
//!
//! [`RtpSender`] is the capture side: samples are written at the graph clock
//! position and drained as fixed-size packets whose payload is handed to the
//! transport straight out of the ring.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::dll::{Dll, DllConfig, DLL_BW_MIN};
use crate::error::{EngineError, EngineResult};
use crate::ring_buffer::RingBuffer;
use crate::rtp_handler::{RtpHeader, RtpPacket};
use crate::transport::{PacketSink, MAX_PACKET_SIZE};
use std::io::IoSlice;
use tracing::{debug, info, trace, warn};

/// Default steady-state overrun guard multiplier
pub const DEFAULT_OVERRUN_FACTOR: u32 = 8;

/// Stream configuration shared by both directions
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bytes per frame (channels × bytes per sample)
    pub stride: u32,
    /// Ring size in bytes, power of two
    pub ring_size: usize,
    /// Frames per outbound packet
    pub packet_samples: u32,
    /// Desired resident frames on the receive side
    pub target_occupancy: u32,
    /// Resident frames above `overrun_factor × target_occupancy` are skipped
    pub overrun_factor: u32,
    /// DLL error clamp in frames
    pub max_error: f32,
    pub dll_bandwidth: f64,
    pub dll_period: u32,
    /// Sender and receiver share the graph clock; the DLL is bypassed
    pub direct_timestamp: bool,
    pub payload_type: u8,
    /// Outbound source identity
    pub ssrc: u32,
    /// Offset between the local ring index and the RTP timestamp
    pub ts_offset: u32,
}

impl StreamConfig {
    /// Defaults for a stream of `sample_rate` Hz with `stride` bytes per frame.
    /// Identity and timestamp offset are random.
    pub fn new(sample_rate: u32, stride: u32) -> Self {
        let ms = |n: u32| (sample_rate as u64 * n as u64 / 1000) as u32;
        StreamConfig {
            sample_rate,
            stride,
            ring_size: 1 << 22,
            packet_samples: ms(4).min(Self::max_packet_samples(stride)).max(1),
            target_occupancy: ms(100),
            overrun_factor: DEFAULT_OVERRUN_FACTOR,
            max_error: ms(2) as f32,
            dll_bandwidth: DLL_BW_MIN,
            dll_period: 128,
            direct_timestamp: false,
            payload_type: 127,
            ssrc: rand::random(),
            ts_offset: rand::random(),
        }
    }

    /// Most frames of `stride` bytes that fit one datagram after the header
    pub fn max_packet_samples(stride: u32) -> u32 {
        ((MAX_PACKET_SIZE - RtpHeader::MIN_SIZE) / stride.max(1) as usize) as u32
    }

    /// Ring capacity in frames
    pub fn capacity_samples(&self) -> u32 {
        if self.stride == 0 {
            return 0;
        }
        (self.ring_size / self.stride as usize) as u32
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 || self.stride == 0 {
            return Err(EngineError::ConfigError(
                "sample rate and stride must be non-zero".to_string(),
            ));
        }
        if !self.ring_size.is_power_of_two() {
            return Err(EngineError::ConfigError(format!(
                "ring size {} is not a power of two",
                self.ring_size
            )));
        }
        let capacity = self.capacity_samples();
        if self.packet_samples == 0 || self.packet_samples > capacity {
            return Err(EngineError::ConfigError(format!(
                "packet of {} frames does not fit a ring of {} frames",
                self.packet_samples, capacity
            )));
        }
        let packet_size = RtpHeader::MIN_SIZE + self.packet_samples as usize * self.stride as usize;
        if packet_size > MAX_PACKET_SIZE {
            return Err(EngineError::ConfigError(format!(
                "packet of {} bytes exceeds the {} byte datagram limit",
                packet_size, MAX_PACKET_SIZE
            )));
        }
        if self.target_occupancy >= capacity {
            return Err(EngineError::ConfigError(format!(
                "target occupancy {} must be below ring capacity {}",
                self.target_occupancy, capacity
            )));
        }
        if self.overrun_factor < 2 {
            return Err(EngineError::ConfigError(
                "overrun factor must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    fn dll_config(&self) -> DllConfig {
        DllConfig {
            bandwidth: self.dll_bandwidth,
            period: self.dll_period,
            sample_rate: self.sample_rate,
            max_error: self.max_error,
            ..DllConfig::default()
        }
    }
}

/// Synchronization state of one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    pub have_sync: bool,
    pub have_ssrc: bool,
    /// Remote (receive) or local (send) source identity
    pub ssrc: u32,
    pub have_seq: bool,
    /// Last sequence number seen or sent
    pub sequence: u16,
    pub timestamp_offset: u32,
    pub target_occupancy: u32,
    /// Set on resync until the first playback pull
    pub first: bool,
}

/// Stream statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Sum of forward sequence gaps
    pub packets_lost: u64,
    /// Malformed or foreign packets
    pub packets_rejected: u64,
    pub resyncs: u64,
    pub underruns: u64,
    pub overruns: u64,
    /// Desync events reported at warn level
    pub desync_warnings: u64,
}

/// Logs the first desync at warn level and repeats at debug level until the
/// stream has run clean for a while
macro_rules! desync {
    ($log:expr, $stats:expr, $($arg:tt)+) => {
        if $log.escalate() {
            $stats.desync_warnings += 1;
            warn!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Warn-once state of one stream
#[derive(Debug, Clone, Copy, Default)]
struct DesyncLog {
    warned: bool,
    /// Frames handled cleanly since the last desync
    clean: u32,
}

impl DesyncLog {
    /// Returns true when this desync should be reported at warn level
    fn escalate(&mut self) -> bool {
        self.clean = 0;
        !std::mem::replace(&mut self.warned, true)
    }

    /// `rearm_after` clean frames make the next desync a warning again
    fn record_clean(&mut self, frames: u32, rearm_after: u32) {
        if !self.warned {
            return;
        }
        self.clean = self.clean.saturating_add(frames);
        if self.clean >= rearm_after {
            self.warned = false;
            self.clean = 0;
        }
    }

    fn quiet(&self) -> bool {
        self.warned
    }
}

/// Result of feeding one packet to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Payload written to the ring
    Written { samples: u32 },
    /// Payload dropped; the next packet resynchronizes
    Overrun { samples: u32 },
}

/// Result of one playback pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// `samples` frames copied out after skipping `skipped` stale frames
    Played { samples: u32, skipped: u32 },
    /// Not enough data; the destination holds silence
    Underrun { samples: u32 },
}

/// Inbound stream: network → ring → playback
#[derive(Debug)]
pub struct RtpReceiver {
    config: StreamConfig,
    ring: RingBuffer,
    dll: Dll,
    state: SyncState,
    stats: StreamStats,
    rate_match: Option<f32>,
    desync: DesyncLog,
}

impl RtpReceiver {
    pub fn new(config: StreamConfig) -> EngineResult<Self> {
        config.validate()?;
        let ring = RingBuffer::new(config.ring_size)?;
        let dll = Dll::new(config.dll_config());
        let state = SyncState {
            timestamp_offset: config.ts_offset,
            target_occupancy: config.target_occupancy,
            ..SyncState::default()
        };

        Ok(RtpReceiver {
            config,
            ring,
            dll,
            state,
            stats: StreamStats::default(),
            rate_match: None,
            desync: DesyncLog::default(),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Last DLL correction
    pub fn correction(&self) -> f32 {
        self.dll.correction()
    }

    /// Playback rate for the host's resampler, `None` in direct mode or
    /// before the first corrected pull
    pub fn rate_match(&self) -> Option<f32> {
        self.rate_match
    }

    /// Handle one datagram.
    ///
    /// Malformed packets and packets from a foreign source are rejected
    /// without touching the sync state. Sequence gaps and overruns are
    /// recovered locally and never returned as errors.
    pub fn receive_packet(&mut self, data: &[u8]) -> EngineResult<ReceiveOutcome> {
        let RtpPacket { header, payload } = match RtpPacket::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.packets_rejected += 1;
                debug!(len = data.len(), error = %e, "Dropping malformed packet");
                return Err(e);
            }
        };

        if self.state.have_ssrc && header.ssrc != self.state.ssrc {
            self.stats.packets_rejected += 1;
            desync!(self.desync, self.stats, expected = self.state.ssrc, got = header.ssrc, "Unexpected SSRC");
            return Err(EngineError::UnexpectedSource {
                expected: self.state.ssrc,
                got: header.ssrc,
            });
        }
        if !self.state.have_ssrc {
            info!(ssrc = header.ssrc, "Adopting stream source");
            self.state.ssrc = header.ssrc;
            self.state.have_ssrc = true;
        }

        self.check_sequence(&header);

        let stride = self.config.stride;
        let samples = payload.len() as u32 / stride;
        self.stats.packets_received += 1;
        self.stats.bytes_received += payload.len() as u64;

        let timestamp = header.timestamp.wrapping_sub(self.state.timestamp_offset);
        let target = self.state.target_occupancy;
        let write = timestamp.wrapping_add(target);

        let (mut filled, expected_write) = self.ring.get_write_index();
        if !self.state.have_sync {
            if self.desync.quiet() {
                debug!(ssrc = header.ssrc, timestamp, target, "Sync to timestamp");
            } else {
                info!(ssrc = header.ssrc, timestamp, target, "Sync to timestamp");
            }
            self.resync(timestamp);
            filled = target as i32;
        } else if expected_write != write {
            debug!(expected = expected_write, got = write, "Unexpected write");
        }

        if filled as i64 + samples as i64 > self.config.capacity_samples() as i64 {
            desync!(self.desync, self.stats, filled, samples, "Capture overrun");
            self.stats.overruns += 1;
            self.state.have_sync = false;
            return Ok(ReceiveOutcome::Overrun { samples });
        }

        let len = (samples * stride) as usize;
        let offset = self.ring.byte_offset(write, stride);
        self.ring.write_data(&payload[..len], offset);
        self.ring.write_update(write.wrapping_add(samples));

        trace!(seq = header.sequence_number, timestamp, samples, "Packet written");
        Ok(ReceiveOutcome::Written { samples })
    }

    fn check_sequence(&mut self, header: &RtpHeader) {
        let seq = header.sequence_number;
        if self.state.have_seq {
            let expected = self.state.sequence.wrapping_add(1);
            if seq != expected {
                let gap = seq.wrapping_sub(expected);
                if gap < 0x8000 {
                    self.stats.packets_lost += gap as u64;
                }
                desync!(self.desync, self.stats, expected, got = seq, "Unexpected sequence number");
                self.state.have_sync = false;
            }
        }
        self.state.sequence = seq;
        self.state.have_seq = true;
    }

    /// Anchor playback `target_occupancy` frames behind `timestamp`, zero the
    /// ring and restart the DLL
    pub fn resync(&mut self, timestamp: u32) {
        let target = self.state.target_occupancy;
        self.ring
            .set_indices(timestamp, timestamp.wrapping_add(target));
        self.ring.clear();
        self.dll.reset();
        self.state.have_sync = true;
        self.state.first = true;
        self.stats.resyncs += 1;
    }

    /// Fill `dst` with as many whole frames as it holds.
    ///
    /// `clock_position` is the graph clock; it is only used in direct
    /// timestamp mode, where it overrides the read cursor.
    pub fn playback_pull(&mut self, dst: &mut [u8], clock_position: Option<u32>) -> PullOutcome {
        let stride = self.config.stride;
        let wanted = dst.len() as u32 / stride;
        let len = (wanted * stride) as usize;

        if self.config.direct_timestamp {
            if let Some(position) = clock_position {
                self.ring.read_update(position);
            }
        }

        let (mut avail, mut timestamp) = self.ring.get_read_index();
        if avail < wanted as i32 {
            dst[..len].fill(0);
            self.stats.underruns += 1;
            desync!(self.desync, self.stats, avail, wanted, "Underrun");
            self.state.have_sync = false;
            return PullOutcome::Underrun { samples: wanted };
        }

        let target = self.state.target_occupancy;
        let mut skipped = 0;
        let mut guard_tripped = false;
        if self.state.first {
            if avail as u32 > target {
                skipped = avail as u32 - target.max(wanted);
            }
            self.state.first = false;
        } else {
            let limit = target
                .saturating_mul(self.config.overrun_factor)
                .min(self.config.capacity_samples());
            if avail as u32 > limit {
                guard_tripped = true;
                skipped = avail as u32 - target.max(wanted);
                self.stats.overruns += 1;
                desync!(self.desync, self.stats, avail, target, "Playback overrun, skipping");
            }
        }
        if skipped > 0 {
            debug!(skipped, "Skipping excess samples");
            timestamp = timestamp.wrapping_add(skipped);
            avail -= skipped as i32;
        }

        if !self.config.direct_timestamp {
            let error = target as f32 - avail as f32;
            let corr = self.dll.update(error);
            self.rate_match = Some(1.0 / corr);
            trace!(avail, error, corr, "DLL update");
        }

        let offset = self.ring.byte_offset(timestamp, stride);
        self.ring.read_data(&mut dst[..len], offset);
        self.ring.read_update(timestamp.wrapping_add(wanted));

        if !guard_tripped {
            self.desync.record_clean(wanted, self.config.sample_rate);
        }
        PullOutcome::Played { samples: wanted, skipped }
    }
}

/// Outbound stream: capture → ring → packets
#[derive(Debug)]
pub struct RtpSender {
    config: StreamConfig,
    ring: RingBuffer,
    state: SyncState,
    stats: StreamStats,
    desync: DesyncLog,
}

impl RtpSender {
    pub fn new(config: StreamConfig) -> EngineResult<Self> {
        config.validate()?;
        let ring = RingBuffer::new(config.ring_size)?;
        let state = SyncState {
            have_ssrc: true,
            ssrc: config.ssrc,
            sequence: rand::random(),
            timestamp_offset: config.ts_offset,
            ..SyncState::default()
        };

        Ok(RtpSender {
            config,
            ring,
            state,
            stats: StreamStats::default(),
            desync: DesyncLog::default(),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Write captured frames at `clock_position`, or right after the previous
    /// capture when there is no clock. Returns the frames written.
    pub fn capture(&mut self, data: &[u8], clock_position: Option<u32>) -> EngineResult<u32> {
        let stride = self.config.stride;
        let wanted = data.len() as u32 / stride;
        if wanted == 0 {
            return Ok(0);
        }
        let capacity = self.config.capacity_samples();
        if wanted > capacity {
            return Err(EngineError::Unsupported(format!(
                "capture of {} frames exceeds ring of {} frames",
                wanted, capacity
            )));
        }

        let (filled, expected) = self.ring.get_write_index();
        let timestamp = clock_position.unwrap_or(expected);

        if self.state.have_sync {
            if expected != timestamp {
                desync!(self.desync, self.stats, expected, got = timestamp, "Unexpected capture timestamp");
                self.state.have_sync = false;
            } else if filled as i64 + wanted as i64 > capacity as i64 {
                desync!(self.desync, self.stats, filled, wanted, "Capture overrun");
                self.stats.overruns += 1;
                self.state.have_sync = false;
            } else {
                self.desync.record_clean(wanted, self.config.sample_rate);
            }
        }
        if !self.state.have_sync {
            if self.desync.quiet() {
                debug!(ssrc = self.state.ssrc, timestamp, "Sync to capture timestamp");
            } else {
                info!(ssrc = self.state.ssrc, timestamp, "Sync to capture timestamp");
            }
            self.ring.set_indices(timestamp, timestamp);
            self.ring.clear();
            self.state.have_sync = true;
            self.stats.resyncs += 1;
        }

        let len = (wanted * stride) as usize;
        let offset = self.ring.byte_offset(timestamp, stride);
        self.ring.write_data(&data[..len], offset);
        self.ring.write_update(timestamp.wrapping_add(wanted));

        Ok(wanted)
    }

    /// Send every complete packet in the ring. Returns the packets sent.
    ///
    /// A failed send loses that packet; the stream keeps its timing.
    pub fn flush_packets(&mut self, sink: &mut dyn PacketSink) -> EngineResult<u32> {
        let stride = self.config.stride;
        let tosend = self.config.packet_samples;
        let (mut avail, mut timestamp) = self.ring.get_read_index();
        if avail < tosend as i32 {
            return Ok(0);
        }

        let mut sent = 0;
        while avail >= tosend as i32 {
            let seq = self.state.sequence.wrapping_add(1);
            let header = RtpHeader::new(
                self.config.payload_type,
                seq,
                self.state.timestamp_offset.wrapping_add(timestamp),
                self.state.ssrc,
            )
            .serialize();

            let len = (tosend * stride) as usize;
            let (first, second) = self.ring.slices(self.ring.byte_offset(timestamp, stride), len);
            let iov = [IoSlice::new(&header), IoSlice::new(first), IoSlice::new(second)];

            match sink.send_packet(&iov) {
                Ok(()) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += len as u64;
                    sent += 1;
                }
                Err(e) => debug!(seq, error = %e, "Packet send failed"),
            }

            self.state.sequence = seq;
            self.state.have_seq = true;
            timestamp = timestamp.wrapping_add(tosend);
            avail -= tosend as i32;
        }
        self.ring.read_update(timestamp);

        Ok(sent)
    }
}
