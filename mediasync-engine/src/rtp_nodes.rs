//! RTP endpoints as graph nodes
//!
//! [`RtpSinkNode`] consumes audio on its input port and sends it as RTP.
//! [`RtpSourceNode`] plays received RTP out of its output port.
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


use crate::buffer_pool::{Chunk, INVALID_ID};
use crate::error::{EngineError, EngineResult};
use crate::format::{
    AudioInfo, Choice, Format, FormatDescriptor, FormatProperty, MediaSubtype, MediaType,
    SampleFormat,
};
use crate::node::{
    BufferRequirements, Direction, IoStatus, Node, NodeInfo, NodeRole, Port, PortIo, ProcessStatus,
};
use crate::rtp_stream::{
    PullOutcome, ReceiveOutcome, RtpReceiver, RtpSender, StreamConfig, StreamStats,
};
use crate::transport::PacketSink;
use tracing::{debug, info};

const MAX_BUFFER_SIZE: u32 = 1 << 16;
const BUFFER_COUNT_MAX: u32 = 32;
const BUFFER_ALIGN: u32 = 16;

fn stream_capabilities(template: &StreamConfig) -> FormatDescriptor {
    FormatDescriptor::new(MediaType::Audio, MediaSubtype::Raw)
        .with(FormatProperty::SampleFormat(Choice::Enum {
            default: SampleFormat::S16LE,
            alternatives: vec![
                SampleFormat::S16LE,
                SampleFormat::S16BE,
                SampleFormat::S24LE,
                SampleFormat::S32LE,
                SampleFormat::F32LE,
            ],
        }))
        .with(FormatProperty::Channels(Choice::Range { default: 2, min: 1, max: 8 }))
        .with(FormatProperty::Rate(Choice::Range {
            default: template.sample_rate,
            min: 8000,
            max: 192000,
        }))
}

/// Stream parameters for a negotiated format, derived from the template
fn stream_config(template: &StreamConfig, info: &AudioInfo) -> StreamConfig {
    let scale = |samples: u32| {
        (samples as u64 * info.rate as u64 / template.sample_rate.max(1) as u64) as u32
    };
    StreamConfig {
        sample_rate: info.rate,
        stride: info.stride(),
        // a higher rate or wider frame must still fit one datagram
        packet_samples: scale(template.packet_samples)
            .min(StreamConfig::max_packet_samples(info.stride()))
            .max(1),
        target_occupancy: scale(template.target_occupancy),
        max_error: template.max_error * info.rate as f32 / template.sample_rate.max(1) as f32,
        ..template.clone()
    }
}

fn requirements(port: &Port, config: Option<&StreamConfig>) -> EngineResult<BufferRequirements> {
    let port_id = port.id();
    let info = port
        .format()
        .and_then(Format::audio)
        .ok_or(EngineError::NoFormat { port_id })?;
    let stride = info.stride();
    let preferred = config
        .map(|c| c.packet_samples * stride)
        .unwrap_or(stride)
        .clamp(stride, MAX_BUFFER_SIZE);

    Ok(BufferRequirements {
        size: Choice::Range { default: preferred, min: stride, max: MAX_BUFFER_SIZE },
        stride,
        count: Choice::Range { default: 2, min: 1, max: BUFFER_COUNT_MAX },
        align: BUFFER_ALIGN,
    })
}

/// Input node sending what it consumes as an RTP stream
pub struct RtpSinkNode<S: PacketSink> {
    port: Port,
    template: StreamConfig,
    sender: Option<RtpSender>,
    sink: S,
    clock_position: Option<u32>,
}

impl<S: PacketSink> RtpSinkNode<S> {
    pub fn new(template: StreamConfig, sink: S) -> Self {
        RtpSinkNode {
            port: Port::new(Direction::Input, 0),
            template,
            sender: None,
            sink,
            clock_position: None,
        }
    }

    /// Graph clock position for the next cycle, in frames
    pub fn set_clock_position(&mut self, position: Option<u32>) {
        self.clock_position = position;
    }

    pub fn sender(&self) -> Option<&RtpSender> {
        self.sender.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn stats(&self) -> StreamStats {
        self.sender.as_ref().map(|s| s.stats().clone()).unwrap_or_default()
    }

    fn check_port(direction: Direction, port_id: u32) -> EngineResult<()> {
        if direction != Direction::Input || port_id != 0 {
            return Err(EngineError::InvalidPort { direction, port_id });
        }
        Ok(())
    }
}

impl<S: PacketSink> Node for RtpSinkNode<S> {
    fn info(&self) -> NodeInfo {
        NodeInfo {
            role: NodeRole::Sink,
            n_input_ports: 1,
            n_output_ports: 0,
        }
    }

    fn port(&self, direction: Direction, port_id: u32) -> EngineResult<&Port> {
        Self::check_port(direction, port_id)?;
        Ok(&self.port)
    }

    fn port_mut(&mut self, direction: Direction, port_id: u32) -> EngineResult<&mut Port> {
        Self::check_port(direction, port_id)?;
        Ok(&mut self.port)
    }

    fn format_candidate(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
    ) -> EngineResult<Option<FormatDescriptor>> {
        Self::check_port(direction, port_id)?;
        Ok((index == 0).then(|| stream_capabilities(&self.template)))
    }

    fn buffer_requirements(&self, direction: Direction, port_id: u32) -> EngineResult<BufferRequirements> {
        requirements(self.port(direction, port_id)?, self.sender.as_ref().map(RtpSender::config))
    }

    fn on_format(&mut self, _direction: Direction, _port_id: u32, format: Option<&Format>) -> EngineResult<()> {
        self.sender = match format.and_then(Format::audio) {
            Some(info) => {
                let config = stream_config(&self.template, info);
                info!(
                    ssrc = config.ssrc,
                    rate = config.sample_rate,
                    stride = config.stride,
                    packet_samples = config.packet_samples,
                    "RTP sender configured"
                );
                Some(RtpSender::new(config)?)
            }
            None => None,
        };
        Ok(())
    }

    fn process(&mut self) -> EngineResult<ProcessStatus> {
        self.port.ensure_ready()?;

        let io = *self.port.io();
        if io.status != IoStatus::HaveData || io.buffer_id == INVALID_ID {
            return Ok(ProcessStatus::NeedInput);
        }

        let sender = self
            .sender
            .as_mut()
            .ok_or(EngineError::NoFormat { port_id: 0 })?;
        let buffer = self.port.pool().get(io.buffer_id).ok_or_else(|| EngineError::InvalidBuffer {
            buffer_id: io.buffer_id,
            reason: "unknown buffer in io slot".to_string(),
        })?;

        let result = sender
            .capture(buffer.payload(), self.clock_position)
            .and_then(|_| sender.flush_packets(&mut self.sink));

        // the buffer is consumed either way; a failed cycle must not replay it
        self.port.io_mut().status = IoStatus::NeedData;
        let sent = result?;
        debug!(buffer_id = io.buffer_id, sent, "consumed input buffer");

        self.port.mark_streaming();
        Ok(ProcessStatus::NeedInput)
    }
}

/// Output node playing a received RTP stream
pub struct RtpSourceNode {
    port: Port,
    template: StreamConfig,
    receiver: Option<RtpReceiver>,
    clock_position: Option<u32>,
}

impl RtpSourceNode {
    pub fn new(template: StreamConfig) -> Self {
        RtpSourceNode {
            port: Port::new(Direction::Output, 0),
            template,
            receiver: None,
            clock_position: None,
        }
    }

    /// Graph clock position for the next cycle, in frames
    pub fn set_clock_position(&mut self, position: Option<u32>) {
        self.clock_position = position;
    }

    /// Feed one datagram from the network
    pub fn receive_packet(&mut self, data: &[u8]) -> EngineResult<ReceiveOutcome> {
        self.receiver
            .as_mut()
            .ok_or(EngineError::NoFormat { port_id: 0 })?
            .receive_packet(data)
    }

    /// Rate the host should resample with
    pub fn rate_match(&self) -> Option<f32> {
        self.receiver.as_ref().and_then(RtpReceiver::rate_match)
    }

    pub fn receiver(&self) -> Option<&RtpReceiver> {
        self.receiver.as_ref()
    }

    pub fn stats(&self) -> StreamStats {
        self.receiver.as_ref().map(|r| r.stats().clone()).unwrap_or_default()
    }

    fn check_port(direction: Direction, port_id: u32) -> EngineResult<()> {
        if direction != Direction::Output || port_id != 0 {
            return Err(EngineError::InvalidPort { direction, port_id });
        }
        Ok(())
    }
}

impl Node for RtpSourceNode {
    fn info(&self) -> NodeInfo {
        NodeInfo {
            role: NodeRole::Source,
            n_input_ports: 0,
            n_output_ports: 1,
        }
    }

    fn port(&self, direction: Direction, port_id: u32) -> EngineResult<&Port> {
        Self::check_port(direction, port_id)?;
        Ok(&self.port)
    }

    fn port_mut(&mut self, direction: Direction, port_id: u32) -> EngineResult<&mut Port> {
        Self::check_port(direction, port_id)?;
        Ok(&mut self.port)
    }

    fn format_candidate(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
    ) -> EngineResult<Option<FormatDescriptor>> {
        Self::check_port(direction, port_id)?;
        Ok((index == 0).then(|| stream_capabilities(&self.template)))
    }

    fn buffer_requirements(&self, direction: Direction, port_id: u32) -> EngineResult<BufferRequirements> {
        requirements(self.port(direction, port_id)?, self.receiver.as_ref().map(RtpReceiver::config))
    }

    fn on_format(&mut self, _direction: Direction, _port_id: u32, format: Option<&Format>) -> EngineResult<()> {
        self.receiver = match format.and_then(Format::audio) {
            Some(info) => {
                let config = stream_config(&self.template, info);
                info!(
                    rate = config.sample_rate,
                    stride = config.stride,
                    target = config.target_occupancy,
                    direct = config.direct_timestamp,
                    "RTP receiver configured"
                );
                Some(RtpReceiver::new(config)?)
            }
            None => None,
        };
        Ok(())
    }

    fn process(&mut self) -> EngineResult<ProcessStatus> {
        self.port.ensure_ready()?;

        let io = *self.port.io();
        if io.status == IoStatus::HaveData {
            return Ok(ProcessStatus::HaveOutput);
        }
        if io.buffer_id != INVALID_ID {
            self.port.pool_mut().reuse(io.buffer_id)?;
        }

        let Some(id) = self.port.pool_mut().dequeue() else {
            debug!("out of buffers");
            return Err(EngineError::OutOfBuffers);
        };

        let receiver = self
            .receiver
            .as_mut()
            .ok_or(EngineError::NoFormat { port_id: 0 })?;
        let stride = receiver.config().stride;
        let buffer = self.port.pool_mut().get_mut(id).ok_or_else(|| EngineError::InvalidBuffer {
            buffer_id: id,
            reason: "dequeued buffer vanished".to_string(),
        })?;

        let len = (buffer.max_size() / stride * stride) as usize;
        let outcome = receiver.playback_pull(&mut buffer.data_mut()[..len], self.clock_position);
        if let PullOutcome::Played { skipped, .. } = outcome {
            if skipped > 0 {
                debug!(skipped, "playback skipped ahead");
            }
        }
        buffer.set_chunk(Chunk {
            offset: 0,
            size: len as u32,
            stride: stride as i32,
        });

        *self.port.io_mut() = PortIo {
            buffer_id: id,
            status: IoStatus::HaveData,
        };
        self.port.mark_streaming();
        Ok(ProcessStatus::HaveOutput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferData, BufferDescriptor};
    use crate::sine_source::SineSource;
    use crate::transport::MAX_PACKET_SIZE;

    fn template() -> StreamConfig {
        StreamConfig {
            ring_size: 1 << 16,
            packet_samples: 64,
            target_occupancy: 256,
            ts_offset: 0,
            ssrc: 0x0102_0304,
            ..StreamConfig::new(44100, 4)
        }
    }

    fn s16_stereo() -> FormatDescriptor {
        Format::Audio(AudioInfo { format: SampleFormat::S16LE, channels: 2, rate: 44100 }).to_descriptor()
    }

    fn host_buffers(n: u32, size: u32) -> Vec<BufferDescriptor> {
        (0..n)
            .map(|id| BufferDescriptor { id, data: BufferData::host(size), ring_meta: false })
            .collect()
    }

    #[test]
    fn test_sink_node_packetizes_input() {
        let mut node = RtpSinkNode::new(template(), Vec::<Vec<u8>>::new());
        assert!(node.set_format(Direction::Output, 0, Some(&s16_stereo())).is_err());
        node.set_format(Direction::Input, 0, Some(&s16_stereo())).unwrap();
        node.use_buffers(Direction::Input, 0, host_buffers(1, 1024)).unwrap();

        // nothing queued yet
        assert_eq!(node.process().unwrap(), ProcessStatus::NeedInput);
        assert!(node.sink().is_empty());

        let port = node.port_mut(Direction::Input, 0).unwrap();
        let buffer = port.pool_mut().get_mut(0).unwrap();
        buffer.data_mut().fill(0x5a);
        buffer.set_chunk(Chunk { offset: 0, size: 1024, stride: 4 });
        *port.io_mut() = PortIo { buffer_id: 0, status: IoStatus::HaveData };

        assert_eq!(node.process().unwrap(), ProcessStatus::NeedInput);
        assert_eq!(node.port_io(Direction::Input, 0).unwrap().status, IoStatus::NeedData);

        // 256 frames in packets of 64
        assert_eq!(node.sink().len(), 4);
        assert_eq!(node.sink()[0].len(), 12 + 256);
        assert_eq!(node.stats().packets_sent, 4);
    }

    #[test]
    fn test_failed_capture_releases_input() {
        // ring of 256 frames, input buffer of 512
        let config = StreamConfig { ring_size: 256 * 4, target_occupancy: 64, ..template() };
        let mut node = RtpSinkNode::new(config, Vec::<Vec<u8>>::new());
        node.set_format(Direction::Input, 0, Some(&s16_stereo())).unwrap();
        node.use_buffers(Direction::Input, 0, host_buffers(1, 2048)).unwrap();

        let port = node.port_mut(Direction::Input, 0).unwrap();
        port.pool_mut().get_mut(0).unwrap().set_chunk(Chunk { offset: 0, size: 2048, stride: 4 });
        *port.io_mut() = PortIo { buffer_id: 0, status: IoStatus::HaveData };

        assert!(matches!(node.process(), Err(EngineError::Unsupported(_))));
        assert_eq!(node.port_io(Direction::Input, 0).unwrap().status, IoStatus::NeedData);

        // the next cycle waits for fresh input instead of failing again
        assert_eq!(node.process().unwrap(), ProcessStatus::NeedInput);
        assert!(node.sink().is_empty());
    }

    #[test]
    fn test_high_rate_packets_fit_a_datagram() {
        let wide = Format::Audio(AudioInfo { format: SampleFormat::F32LE, channels: 8, rate: 192000 })
            .to_descriptor();
        let mut node = RtpSinkNode::new(template(), Vec::<Vec<u8>>::new());
        node.set_format(Direction::Input, 0, Some(&wide)).unwrap();

        let config = node.sender().unwrap().config();
        assert_eq!(config.stride, 32);
        assert_eq!(config.packet_samples, StreamConfig::max_packet_samples(32));
        assert!(12 + (config.packet_samples * config.stride) as usize <= MAX_PACKET_SIZE);
    }

    #[test]
    fn test_requirements_follow_packet_size() {
        let mut node = RtpSourceNode::new(template());
        node.set_format(Direction::Output, 0, Some(&s16_stereo())).unwrap();
        let req = node.buffer_requirements(Direction::Output, 0).unwrap();
        assert_eq!(req.preferred_size(), 256);
        assert_eq!(req.stride, 4);
    }

    #[test]
    fn test_source_node_requires_format_for_packets() {
        let mut node = RtpSourceNode::new(template());
        assert_eq!(
            node.receive_packet(&[0x80, 0, 0, 0]).unwrap_err(),
            EngineError::NoFormat { port_id: 0 }
        );
        assert_eq!(node.rate_match(), None);
    }

    #[test]
    fn test_sine_through_rtp() {
        let mut tone = SineSource::new();
        tone.set_format(Direction::Output, 0, Some(&s16_stereo())).unwrap();
        tone.use_buffers(Direction::Output, 0, host_buffers(2, 256)).unwrap();

        let mut sink = RtpSinkNode::new(template(), Vec::<Vec<u8>>::new());
        sink.set_format(Direction::Input, 0, Some(&s16_stereo())).unwrap();

        let mut source = RtpSourceNode::new(template());
        source.set_format(Direction::Output, 0, Some(&s16_stereo())).unwrap();
        source.use_buffers(Direction::Output, 0, host_buffers(2, 256)).unwrap();

        let mut last_played = Vec::new();
        for _ in 0..40 {
            // move the tone's buffer into the sink's input port
            tone.process().unwrap();
            let io = tone.port_io(Direction::Output, 0).unwrap();
            let payload = tone.port(Direction::Output, 0).unwrap().pool().get(io.buffer_id).unwrap().payload().to_vec();
            tone.port_mut(Direction::Output, 0).unwrap().io_mut().status = IoStatus::NeedData;

            let mut data = BufferData::host(payload.len() as u32);
            if let Some(memory) = data.memory.as_mut() {
                memory.copy_from_slice(&payload);
            }
            sink.use_buffers(Direction::Input, 0, vec![BufferDescriptor { id: 7, data, ring_meta: false }])
                .unwrap();
            let port = sink.port_mut(Direction::Input, 0).unwrap();
            port.pool_mut().get_mut(7).unwrap().set_chunk(Chunk { offset: 0, size: 256, stride: 4 });
            *port.io_mut() = PortIo { buffer_id: 7, status: IoStatus::HaveData };
            sink.process().unwrap();

            for packet in sink.sink_mut().drain(..) {
                source.receive_packet(&packet).unwrap();
            }

            source.process().unwrap();
            let out = source.port_io(Direction::Output, 0).unwrap();
            last_played = source.port(Direction::Output, 0).unwrap().pool().get(out.buffer_id).unwrap().payload().to_vec();
            source.port_mut(Direction::Output, 0).unwrap().io_mut().status = IoStatus::NeedData;
        }

        let receiver = source.receiver().unwrap();
        assert!(receiver.state().have_sync);
        assert_eq!(receiver.stats().resyncs, 1);
        assert_eq!(receiver.stats().underruns, 0);
        assert!(last_played.iter().any(|b| *b != 0));
        assert!(source.rate_match().is_some());
    }
}
