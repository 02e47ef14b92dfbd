//! Minimal graph host driving the engine nodes
//!
//! The sender copies each sine buffer into the RTP sink's input port once per
//! tick. The receiver feeds datagrams to the RTP source as they arrive and
//! pulls one buffer per tick. Both run on a single task, so packet handling
//! and processing never overlap.
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


use anyhow::{Context, Result};
use mediasync_config::AppConfig;
use mediasync_engine::{
    AudioInfo, BufferData, BufferDescriptor, Chunk, Direction, EngineError, Format, IoStatus,
    Node, PacketSink, PortIo, RtpSinkNode, RtpSourceNode, SampleFormat, SineSource, StreamConfig,
    StreamStats, UdpTransport, MAX_PACKET_SIZE,
};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Ticks between two statistics reports
const STATS_INTERVAL_TICKS: u64 = 1000;

/// Buffers handed to each port
const BUFFER_COUNT: u32 = 2;

/// Stream parameters from the application configuration
pub fn stream_template(config: &AppConfig) -> StreamConfig {
    let stride = config.channels * SampleFormat::S16LE.bytes_per_sample();
    let mut template = StreamConfig::new(config.sample_rate, stride);
    template.ring_size = config.ring_size;
    template.packet_samples = config.packet_samples();
    template.target_occupancy = config.target_occupancy();
    template.overrun_factor = config.overrun_factor;
    template.max_error = config.max_error();
    template.dll_bandwidth = config.dll_bandwidth;
    template.dll_period = config.dll_period;
    template.direct_timestamp = config.direct_timestamp;
    template.payload_type = config.payload_type;
    if let Some(ssrc) = config.ssrc {
        template.ssrc = ssrc;
    }
    if let Some(ts_offset) = config.ts_offset {
        template.ts_offset = ts_offset;
    }
    template
}

fn stream_format(template: &StreamConfig) -> Format {
    Format::Audio(AudioInfo {
        format: SampleFormat::S16LE,
        channels: template.stride / SampleFormat::S16LE.bytes_per_sample(),
        rate: template.sample_rate,
    })
}

fn host_buffers(count: u32, size: u32) -> Vec<BufferDescriptor> {
    (0..count)
        .map(|id| BufferDescriptor { id, data: BufferData::host(size), ring_meta: false })
        .collect()
}

/// Buffer size for one packet, clamped to what the node accepts
fn buffer_size<N: Node>(node: &N, direction: Direction, packet_samples: u32) -> Result<u32> {
    let req = node.buffer_requirements(direction, 0)?;
    let (min, max) = req.size_range();
    let size = (packet_samples * req.stride).clamp(min, max);
    Ok(size / req.stride.max(1) * req.stride.max(1))
}

/// Sine source wired to an RTP sink
pub struct SenderHost<S: PacketSink> {
    tone: SineSource,
    sink: RtpSinkNode<S>,
    position: u32,
    ticks: u64,
}

impl<S: PacketSink> SenderHost<S> {
    pub fn new(template: StreamConfig, packet_sink: S) -> Result<Self> {
        let format = stream_format(&template).to_descriptor();
        let packet_samples = template.packet_samples;

        let mut tone = SineSource::new();
        tone.set_format(Direction::Output, 0, Some(&format))?;
        let size = buffer_size(&tone, Direction::Output, packet_samples)?;
        tone.use_buffers(Direction::Output, 0, host_buffers(BUFFER_COUNT, size))?;

        let mut sink = RtpSinkNode::new(template, packet_sink);
        sink.set_format(Direction::Input, 0, Some(&format))?;
        sink.use_buffers(Direction::Input, 0, host_buffers(1, size))?;

        Ok(SenderHost { tone, sink, position: 0, ticks: 0 })
    }

    /// One graph cycle: produce a tone buffer and send it
    pub fn tick(&mut self) -> Result<()> {
        match self.tone.process() {
            Ok(_) => {}
            Err(e) if e.is_backpressure() => {
                debug!("tone source has no free buffer");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let io = self.tone.port_io(Direction::Output, 0)?;
        let stride = self.sink.sender().map_or(1, |s| s.config().stride);
        let frames = {
            let tone_port = self.tone.port(Direction::Output, 0)?;
            let payload = tone_port
                .pool()
                .get(io.buffer_id)
                .map(|b| b.payload())
                .ok_or(EngineError::InvalidBuffer {
                    buffer_id: io.buffer_id,
                    reason: "tone output missing".to_string(),
                })?;

            let sink_port = self.sink.port_mut(Direction::Input, 0)?;
            let buffer = sink_port.pool_mut().get_mut(0).ok_or(EngineError::NoBuffers { port_id: 0 })?;
            let len = payload.len().min(buffer.max_size() as usize);
            buffer.data_mut()[..len].copy_from_slice(&payload[..len]);

            buffer.set_chunk(Chunk { offset: 0, size: len as u32, stride: stride as i32 });
            *sink_port.io_mut() = PortIo { buffer_id: 0, status: IoStatus::HaveData };
            len as u32 / stride
        };
        self.tone.port_mut(Direction::Output, 0)?.io_mut().status = IoStatus::NeedData;

        self.sink.set_clock_position(Some(self.position));
        self.sink.process()?;
        self.position = self.position.wrapping_add(frames);
        self.ticks += 1;

        if self.ticks % STATS_INTERVAL_TICKS == 0 {
            log_stats("send", &self.stats());
        }
        Ok(())
    }

    pub fn stats(&self) -> StreamStats {
        self.sink.stats()
    }

    pub fn packet_sink(&self) -> &S {
        self.sink.sink()
    }

    pub fn packet_sink_mut(&mut self) -> &mut S {
        self.sink.sink_mut()
    }
}

/// RTP source played out by the tick
pub struct ReceiverHost {
    source: RtpSourceNode,
    position: u32,
    ticks: u64,
    silent_ticks: u64,
}

impl ReceiverHost {
    pub fn new(template: StreamConfig) -> Result<Self> {
        let format = stream_format(&template).to_descriptor();
        let packet_samples = template.packet_samples;

        let mut source = RtpSourceNode::new(template);
        source.set_format(Direction::Output, 0, Some(&format))?;
        let size = buffer_size(&source, Direction::Output, packet_samples)?;
        source.use_buffers(Direction::Output, 0, host_buffers(BUFFER_COUNT, size))?;

        Ok(ReceiverHost { source, position: 0, ticks: 0, silent_ticks: 0 })
    }

    /// Hand one datagram to the stream. Bad packets are logged and dropped.
    pub fn on_packet(&mut self, data: &[u8]) {
        if let Err(e) = self.source.receive_packet(data) {
            debug!(error = %e, len = data.len(), "packet dropped");
        }
    }

    /// One graph cycle: pull a buffer and "render" it
    pub fn tick(&mut self) -> Result<()> {
        self.source.set_clock_position(Some(self.position));
        match self.source.process() {
            Ok(_) => {}
            Err(e) if e.is_backpressure() => {
                debug!("playback has no free buffer");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let io = self.source.port_io(Direction::Output, 0)?;
        let port = self.source.port_mut(Direction::Output, 0)?;
        let (frames, silent) = match port.pool().get(io.buffer_id) {
            Some(buffer) => {
                let chunk = buffer.chunk();
                let stride = chunk.stride.max(1) as u32;
                (chunk.size / stride, buffer.payload().iter().all(|b| *b == 0))
            }
            None => (0, true),
        };
        port.io_mut().status = IoStatus::NeedData;

        if silent {
            self.silent_ticks += 1;
        }
        self.position = self.position.wrapping_add(frames);
        self.ticks += 1;

        if self.ticks % STATS_INTERVAL_TICKS == 0 {
            log_stats("receive", &self.stats());
            info!(
                rate_match = ?self.source.rate_match(),
                silent_ticks = self.silent_ticks,
                "playback status"
            );
        }
        Ok(())
    }

    pub fn stats(&self) -> StreamStats {
        self.source.stats()
    }

    pub fn rate_match(&self) -> Option<f32> {
        self.source.rate_match()
    }

    pub fn has_sync(&self) -> bool {
        self.source.receiver().is_some_and(|r| r.state().have_sync)
    }
}

fn log_stats(direction: &str, stats: &StreamStats) {
    info!(
        direction,
        packets_sent = stats.packets_sent,
        packets_received = stats.packets_received,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        packets_lost = stats.packets_lost,
        packets_rejected = stats.packets_rejected,
        resyncs = stats.resyncs,
        underruns = stats.underruns,
        overruns = stats.overruns,
        desync_warnings = stats.desync_warnings,
        "stream statistics"
    );
}

fn tick_period(config: &AppConfig) -> Duration {
    Duration::from_millis(config.packet_ms.max(1) as u64)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Run the sender until Ctrl+C
pub async fn run_sender(config: &AppConfig) -> Result<()> {
    let transport = UdpTransport::bind(config.local_addr, Some(config.remote_addr))
        .await
        .context("Failed to open sender socket")?;
    let mut host = SenderHost::new(stream_template(config), transport)?;
    let mut ticker = tokio::time::interval(tick_period(config));

    info!(remote = %config.remote_addr, "Sender running. Press Ctrl+C to stop.");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = host.tick() {
                    warn!(error = %e, "send cycle failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    log_stats("send", &host.stats());
    Ok(())
}

/// Run the receiver until Ctrl+C
pub async fn run_receiver(config: &AppConfig) -> Result<()> {
    let transport = UdpTransport::bind(config.local_addr, None)
        .await
        .context("Failed to open receiver socket")?;
    let mut host = ReceiverHost::new(stream_template(config))?;
    let mut ticker = tokio::time::interval(tick_period(config));
    let mut packet = vec![0u8; MAX_PACKET_SIZE];

    info!(local = %config.local_addr, "Receiver running. Press Ctrl+C to stop.");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            received = transport.recv(&mut packet) => {
                match received {
                    Ok((data, _from)) => host.on_packet(data),
                    Err(e) => warn!(error = %e, "receive failed"),
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = host.tick() {
                    warn!(error = %e, "playback cycle failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    log_stats("receive", &host.stats());
    Ok(())
}
