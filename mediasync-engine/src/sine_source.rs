//! Sine test source
//!
//! A single-output source node producing a 440 Hz tone. Used by the sender
//! daemon and as the reference implementation of the node contract.
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


use crate::buffer_pool::{Chunk, MemoryMapper, INVALID_ID};
use crate::error::{EngineError, EngineResult};
use crate::format::{
    Choice, Format, FormatDescriptor, FormatProperty, MediaSubtype, MediaType, SampleFormat,
};
use crate::node::{
    BufferRequirements, Direction, IoStatus, Node, NodeInfo, NodeRole, Port, PortIo, ProcessStatus,
};
use crate::sample_convert::{select_converter, DitherConfig, SampleConverter};
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::{debug, trace};

pub const DEFAULT_FREQUENCY: f64 = 440.0;
pub const DEFAULT_VOLUME: f32 = 0.5;
pub const DEFAULT_RATE: u32 = 44100;
pub const DEFAULT_CHANNELS: u32 = 2;

const BUFFER_SIZE_DEFAULT: u32 = 1024;
const BUFFER_SIZE_MIN: u32 = 32;
const BUFFER_SIZE_MAX: u32 = 4096;
const BUFFER_COUNT_MIN: u32 = 2;
const BUFFER_COUNT_MAX: u32 = 32;
const BUFFER_ALIGN: u32 = 16;

/// Source node generating a sine tone
pub struct SineSource {
    port: Port,
    converter: Option<Box<dyn SampleConverter>>,
    dither: DitherConfig,
    mapper: Option<Arc<dyn MemoryMapper>>,
    frequency: f64,
    volume: f32,
    phase: f64,
    scratch: Vec<f32>,
}

impl SineSource {
    pub fn new() -> Self {
        SineSource {
            port: Port::new(Direction::Output, 0),
            converter: None,
            dither: DitherConfig::default(),
            mapper: None,
            frequency: DEFAULT_FREQUENCY,
            volume: DEFAULT_VOLUME,
            phase: 0.0,
            scratch: Vec::new(),
        }
    }

    /// Dither applied to integer formats negotiated from now on
    pub fn with_dither(mut self, dither: DitherConfig) -> Self {
        self.dither = dither;
        self
    }

    /// Mapper for descriptor-backed buffers
    pub fn with_mapper(mut self, mapper: Arc<dyn MemoryMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn set_tone(&mut self, frequency: f64, volume: f32) {
        self.frequency = frequency;
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn capabilities() -> FormatDescriptor {
        FormatDescriptor::new(MediaType::Audio, MediaSubtype::Raw)
            .with(FormatProperty::SampleFormat(Choice::Enum {
                default: SampleFormat::S16LE,
                alternatives: vec![SampleFormat::S16LE, SampleFormat::F32LE],
            }))
            .with(FormatProperty::Channels(Choice::Range {
                default: DEFAULT_CHANNELS,
                min: 1,
                max: 8,
            }))
            .with(FormatProperty::Rate(Choice::Range {
                default: DEFAULT_RATE,
                min: 8000,
                max: 192000,
            }))
    }

    fn check_port(direction: Direction, port_id: u32) -> EngineResult<()> {
        if direction != Direction::Output || port_id != 0 {
            return Err(EngineError::InvalidPort { direction, port_id });
        }
        Ok(())
    }
}

impl Default for SineSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for SineSource {
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
        Ok((index == 0).then(Self::capabilities))
    }

    fn buffer_requirements(&self, direction: Direction, port_id: u32) -> EngineResult<BufferRequirements> {
        let port = self.port(direction, port_id)?;
        let info = port
            .format()
            .and_then(Format::audio)
            .ok_or(EngineError::NoFormat { port_id })?;

        Ok(BufferRequirements {
            size: Choice::Range {
                default: BUFFER_SIZE_DEFAULT,
                min: BUFFER_SIZE_MIN,
                max: BUFFER_SIZE_MAX,
            },
            stride: info.stride(),
            count: Choice::Range {
                default: BUFFER_COUNT_MIN,
                min: BUFFER_COUNT_MIN,
                max: BUFFER_COUNT_MAX,
            },
            align: BUFFER_ALIGN,
        })
    }

    fn on_format(&mut self, _direction: Direction, _port_id: u32, format: Option<&Format>) -> EngineResult<()> {
        self.converter = match format.and_then(Format::audio) {
            Some(info) => {
                let converter = select_converter(info.format, self.dither)?;
                debug!(converter = converter.name(), "selected sample converter");
                Some(converter)
            }
            None => None,
        };
        self.phase = 0.0;
        Ok(())
    }

    fn memory_mapper(&self) -> Option<Arc<dyn MemoryMapper>> {
        self.mapper.clone()
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

        let info = match self.port.format().and_then(Format::audio) {
            Some(info) => *info,
            None => return Err(EngineError::NoFormat { port_id: 0 }),
        };
        let SineSource { port, converter, frequency, volume, phase, scratch, .. } = self;
        let converter = converter
            .as_mut()
            .ok_or(EngineError::NoFormat { port_id: 0 })?;
        let buffer = port.pool_mut().get_mut(id).ok_or_else(|| EngineError::InvalidBuffer {
            buffer_id: id,
            reason: "dequeued buffer vanished".to_string(),
        })?;

        let stride = info.stride();
        let mut tone = Tone {
            step: TAU * *frequency / info.rate as f64,
            volume: *volume,
            channels: info.channels as usize,
            phase,
            scratch,
        };

        let max_size = buffer.max_size();
        if let Some(mut ring) = buffer.ring_meta().copied() {
            let (filled, index) = ring.get_write_index();
            let avail = max_size.saturating_sub(filled.max(0) as u32);
            let offset = index % max_size.max(1);
            let contiguous = avail.min(max_size - offset);
            let frames = contiguous / stride;
            let len = (frames * stride) as usize;

            let start = offset as usize;
            tone.fill(converter.as_mut(), &mut buffer.data_mut()[start..start + len]);
            ring.write_update(index.wrapping_add(len as u32));
            if let Some(meta) = buffer.ring_meta_mut() {
                *meta = ring;
            }
            trace!(buffer_id = id, offset, frames, "wrote into ring metadata");
        } else {
            let frames = max_size / stride;
            let len = (frames * stride) as usize;
            tone.fill(converter.as_mut(), &mut buffer.data_mut()[..len]);
            buffer.set_chunk(Chunk {
                offset: 0,
                size: len as u32,
                stride: stride as i32,
            });
            trace!(buffer_id = id, frames, "filled buffer");
        }

        *port.io_mut() = PortIo {
            buffer_id: id,
            status: IoStatus::HaveData,
        };
        port.mark_streaming();
        Ok(ProcessStatus::HaveOutput)
    }
}

struct Tone<'a> {
    step: f64,
    volume: f32,
    channels: usize,
    phase: &'a mut f64,
    scratch: &'a mut Vec<f32>,
}

impl Tone<'_> {
    fn fill(&mut self, converter: &mut dyn SampleConverter, dst: &mut [u8]) {
        let width = converter.output_format().bytes_per_sample() as usize;
        let samples = dst.len() / width;
        let frames = samples / self.channels.max(1);
        if self.scratch.len() < samples {
            self.scratch.resize(samples, 0.0);
        }

        for frame in self.scratch[..samples].chunks_exact_mut(self.channels.max(1)).take(frames) {
            let value = self.phase.sin() as f32 * self.volume;
            frame.fill(value);
            *self.phase += self.step;
            if *self.phase >= TAU {
                *self.phase -= TAU;
            }
        }

        converter.convert(&self.scratch[..samples], dst);
    }
}
