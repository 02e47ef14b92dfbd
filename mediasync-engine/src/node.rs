//! Node/port contract between processing units and the host graph
//!
//! A node publishes per-port format capabilities, accepts a concrete format,
//! advertises its buffer requirements, takes ownership of the buffers the
//! host provides and exchanges them with the host through a per-port I/O
//! slot once per processing cycle.
//!
//! Port lifecycle:
//!
//! ```text
//! Unconfigured -> FormatNegotiated -> BuffersProvided -> Streaming
//!       ^                                                    |
//!       +---------------- set_format(None) ------------------+
//! ```
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


use crate::buffer_pool::{BufferDescriptor, BufferPool, MemoryMapper, INVALID_ID};
use crate::error::{EngineError, EngineResult};
use crate::format::{Choice, Format, FormatDescriptor};
use std::sync::Arc;
use tracing::debug;

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// Role a node plays in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Source,
    Sink,
    Filter,
}

/// Static node description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub role: NodeRole,
    pub n_input_ports: u32,
    pub n_output_ports: u32,
}

/// Status flag of an I/O slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    NeedData,
    HaveData,
}

/// Per-port slot shared with the host scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortIo {
    pub buffer_id: u32,
    pub status: IoStatus,
}

impl Default for PortIo {
    fn default() -> Self {
        PortIo {
            buffer_id: INVALID_ID,
            status: IoStatus::Ok,
        }
    }
}

/// Outcome of a successful processing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    HaveOutput,
    NeedInput,
}

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Unconfigured,
    FormatNegotiated,
    BuffersProvided,
    Streaming,
}

/// Buffer size and count ranges a port can operate with
#[derive(Debug, Clone, PartialEq)]
pub struct BufferRequirements {
    /// Bytes per buffer
    pub size: Choice<u32>,
    /// Bytes per frame, 0 when not applicable
    pub stride: u32,
    /// Number of buffers
    pub count: Choice<u32>,
    /// Required alignment of the data
    pub align: u32,
}

impl BufferRequirements {
    pub fn preferred_size(&self) -> u32 {
        *self.size.default_value()
    }

    pub fn preferred_count(&self) -> u32 {
        *self.count.default_value()
    }

    pub fn size_range(&self) -> (u32, u32) {
        range_of(&self.size)
    }

    pub fn count_range(&self) -> (u32, u32) {
        range_of(&self.count)
    }

    /// Whether an allocation of `count` buffers of `size` bytes fits
    pub fn accepts(&self, size: u32, count: u32) -> bool {
        let (min_size, max_size) = self.size_range();
        let (min_count, max_count) = self.count_range();
        (min_size..=max_size).contains(&size) && (min_count..=max_count).contains(&count)
    }
}

fn range_of(choice: &Choice<u32>) -> (u32, u32) {
    match choice {
        Choice::Fixed(v) => (*v, *v),
        Choice::Range { min, max, .. } | Choice::Step { min, max, .. } => (*min, *max),
        Choice::Enum { alternatives, .. } => (
            alternatives.iter().copied().min().unwrap_or(0),
            alternatives.iter().copied().max().unwrap_or(0),
        ),
    }
}

/// Port state shared by all node implementations
#[derive(Debug)]
pub struct Port {
    direction: Direction,
    id: u32,
    format: Option<Format>,
    pool: BufferPool,
    io: PortIo,
    state: PortState,
}

impl Port {
    pub fn new(direction: Direction, id: u32) -> Self {
        Port {
            direction,
            id,
            format: None,
            pool: BufferPool::new(),
            io: PortIo::default(),
            state: PortState::Unconfigured,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn io(&self) -> &PortIo {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut PortIo {
        &mut self.io
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Set or clear the format. Either way the buffers are invalidated.
    pub fn set_format(&mut self, format: Option<Format>) {
        self.pool.clear();
        self.io = PortIo::default();
        self.state = if format.is_some() {
            PortState::FormatNegotiated
        } else {
            PortState::Unconfigured
        };
        self.format = format;
    }

    /// Install the host's buffers. An empty list releases the current ones.
    pub fn use_buffers(
        &mut self,
        buffers: Vec<BufferDescriptor>,
        mapper: Option<&dyn MemoryMapper>,
    ) -> EngineResult<()> {
        if self.format.is_none() {
            return Err(EngineError::NoFormat { port_id: self.id });
        }

        if buffers.is_empty() {
            self.pool.clear();
            self.io = PortIo::default();
            self.state = PortState::FormatNegotiated;
            return Ok(());
        }

        self.pool.use_buffers(buffers, mapper)?;
        self.io = PortIo::default();
        self.state = PortState::BuffersProvided;
        debug!(port_id = self.id, n_buffers = self.pool.len(), "buffers provided");
        Ok(())
    }

    /// Fails unless a format is set and buffers are present
    pub fn ensure_ready(&self) -> EngineResult<()> {
        if self.format.is_none() {
            return Err(EngineError::NoFormat { port_id: self.id });
        }
        if self.pool.is_empty() {
            return Err(EngineError::NoBuffers { port_id: self.id });
        }
        Ok(())
    }

    pub fn mark_streaming(&mut self) {
        if self.state == PortState::BuffersProvided {
            self.state = PortState::Streaming;
        }
    }
}

/// The contract every processing node implements.
///
/// Implementors provide the port lookup, their raw capability list, buffer
/// requirements and the real-time `process` step; negotiation and buffer
/// hand-off are shared through the provided methods.
pub trait Node {
    fn info(&self) -> NodeInfo;

    fn port(&self, direction: Direction, port_id: u32) -> EngineResult<&Port>;

    fn port_mut(&mut self, direction: Direction, port_id: u32) -> EngineResult<&mut Port>;

    /// The `index`-th supported format of a port, unfiltered. `None` ends
    /// the list. Must not change node state.
    fn format_candidate(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
    ) -> EngineResult<Option<FormatDescriptor>>;

    fn buffer_requirements(&self, direction: Direction, port_id: u32) -> EngineResult<BufferRequirements>;

    /// Single real-time entry point, called once per graph cycle
    fn process(&mut self) -> EngineResult<ProcessStatus>;

    /// Called before a new format is committed to a port. An error leaves the
    /// port untouched.
    fn on_format(&mut self, _direction: Direction, _port_id: u32, _format: Option<&Format>) -> EngineResult<()> {
        Ok(())
    }

    /// Mapper used for descriptor-backed buffers
    fn memory_mapper(&self) -> Option<Arc<dyn MemoryMapper>> {
        None
    }

    /// Next supported format at or after `cursor` that passes `filter`,
    /// together with the cursor to resume from.
    fn enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        cursor: u32,
        filter: Option<&FormatDescriptor>,
    ) -> EngineResult<Option<(u32, FormatDescriptor)>> {
        let mut index = cursor;
        while let Some(candidate) = self.format_candidate(direction, port_id, index)? {
            index = index.saturating_add(1);
            if let Some(filtered) = candidate.filter(filter) {
                return Ok(Some((index, filtered)));
            }
        }
        Ok(None)
    }

    /// Whether any advertised candidate accepts `format`
    fn supports_format(&self, direction: Direction, port_id: u32, format: &Format) -> EngineResult<bool> {
        let mut index = 0;
        while let Some(candidate) = self.format_candidate(direction, port_id, index)? {
            if candidate.accepts(format) {
                return Ok(true);
            }
            index += 1;
        }
        Ok(false)
    }

    /// Negotiate a concrete format, or clear it with `None`
    fn set_format(
        &mut self,
        direction: Direction,
        port_id: u32,
        format: Option<&FormatDescriptor>,
    ) -> EngineResult<()> {
        self.port(direction, port_id)?;

        let Some(descriptor) = format else {
            self.on_format(direction, port_id, None)?;
            self.port_mut(direction, port_id)?.set_format(None);
            return Ok(());
        };

        let parsed = Format::parse(descriptor)?;
        if !self.supports_format(direction, port_id, &parsed)? {
            return Err(EngineError::InvalidFormat(format!("{:?} not supported", parsed)));
        }

        self.on_format(direction, port_id, Some(&parsed))?;
        self.port_mut(direction, port_id)?.set_format(Some(parsed));
        debug!(?direction, port_id, format = ?parsed, "format negotiated");
        Ok(())
    }

    fn format(&self, direction: Direction, port_id: u32) -> EngineResult<Option<Format>> {
        Ok(self.port(direction, port_id)?.format().copied())
    }

    /// Take over the host's buffers for a port
    fn use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<BufferDescriptor>,
    ) -> EngineResult<()> {
        let mapper = self.memory_mapper();
        self.port_mut(direction, port_id)?.use_buffers(buffers, mapper.as_deref())
    }

    /// Return an output buffer to the free list. Already-free buffers are
    /// left alone.
    fn reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> EngineResult<()> {
        self.port_mut(Direction::Output, port_id)?.pool_mut().reuse(buffer_id)?;
        Ok(())
    }

    fn port_io(&self, direction: Direction, port_id: u32) -> EngineResult<PortIo> {
        Ok(*self.port(direction, port_id)?.io())
    }
}

/// Restartable iterator over a port's filtered capabilities
pub struct FormatEnumerator<'a, N: Node + ?Sized> {
    node: &'a N,
    direction: Direction,
    port_id: u32,
    filter: Option<&'a FormatDescriptor>,
    cursor: u32,
}

impl<'a, N: Node + ?Sized> FormatEnumerator<'a, N> {
    pub fn new(node: &'a N, direction: Direction, port_id: u32, filter: Option<&'a FormatDescriptor>) -> Self {
        FormatEnumerator {
            node,
            direction,
            port_id,
            filter,
            cursor: 0,
        }
    }

    /// Start over from the first candidate
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl<N: Node + ?Sized> Iterator for FormatEnumerator<'_, N> {
    type Item = EngineResult<FormatDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.node.enum_formats(self.direction, self.port_id, self.cursor, self.filter) {
            Ok(Some((next, format))) => {
                self.cursor = next;
                Some(Ok(format))
            }
            Ok(None) => None,
            Err(e) => {
                // stop after reporting the error once
                self.cursor = u32::MAX;
                Some(Err(e))
            }
        }
    }
}
