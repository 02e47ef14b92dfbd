//! Per-port buffer pool with explicit ownership hand-off
//!
//! The host graph provides a fixed set of buffers per port. Each buffer is
//! either `Free` (owned by the node, waiting to be filled) or `InFlight`
//! (handed to the peer through the port I/O slot until it is reused).
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


use crate::error::{EngineError, EngineResult};
use crate::ring_buffer::RingCursors;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, trace};

/// Id meaning "no buffer" in I/O slots
pub const INVALID_ID: u32 = u32::MAX;

/// How the host backs a buffer's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Plain memory owned by the host, already accessible
    MemPtr,
    /// Shared memory file descriptor, must be mapped
    MemFd,
    /// DMA buffer descriptor, must be mapped
    DmaBuf,
    /// Anything else
    Other,
}

/// Memory description handed over by the host
#[derive(Debug)]
pub struct BufferData {
    pub data_type: DataType,
    /// Host-owned bytes (for `MemPtr`)
    pub memory: Option<BytesMut>,
    /// Descriptor to map (for `MemFd`/`DmaBuf`)
    pub fd: Option<i64>,
    pub map_offset: u32,
    pub max_size: u32,
}

impl BufferData {
    /// Host-owned memory of `size` zeroed bytes
    pub fn host(size: u32) -> Self {
        BufferData {
            data_type: DataType::MemPtr,
            memory: Some(BytesMut::zeroed(size as usize)),
            fd: None,
            map_offset: 0,
            max_size: size,
        }
    }

    /// Descriptor-backed memory that the node has to map
    pub fn fd(data_type: DataType, fd: i64, map_offset: u32, max_size: u32) -> Self {
        BufferData {
            data_type,
            memory: None,
            fd: Some(fd),
            map_offset,
            max_size,
        }
    }
}

/// A buffer as provided by the host graph
#[derive(Debug)]
pub struct BufferDescriptor {
    pub id: u32,
    pub data: BufferData,
    /// Attach ring cursor metadata to this buffer
    pub ring_meta: bool,
}

/// Memory obtained from a [`MemoryMapper`]. Dropping it releases the mapping.
pub trait MappedRegion: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Capability to map descriptor-backed memory
pub trait MemoryMapper: Send + Sync {
    fn map(&self, data_type: DataType, fd: i64, offset: u32, size: u32) -> EngineResult<Box<dyn MappedRegion>>;
}

/// Where a buffer's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    HostOwned,
    ExternallyMapped,
}

/// The data region of a pool buffer
pub enum Region {
    Host(BytesMut),
    Mapped(Box<dyn MappedRegion>),
}

impl Region {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Host(bytes) => bytes,
            Region::Mapped(map) => map.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Host(bytes) => bytes,
            Region::Mapped(map) => map.as_mut_slice(),
        }
    }

    pub fn backing(&self) -> Backing {
        match self {
            Region::Host(_) => Backing::HostOwned,
            Region::Mapped(_) => Backing::ExternallyMapped,
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("backing", &self.backing())
            .field("len", &self.as_slice().len())
            .finish()
    }
}

/// Valid payload within a buffer's region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
}

/// Ownership state of a pool buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    InFlight,
}

/// A buffer owned by a port's pool
#[derive(Debug)]
pub struct Buffer {
    id: u32,
    region: Region,
    chunk: Chunk,
    ring: Option<RingCursors>,
    state: BufferState,
}

impl Buffer {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn max_size(&self) -> u32 {
        self.region.as_slice().len() as u32
    }

    pub fn backing(&self) -> Backing {
        self.region.backing()
    }

    /// The whole region
    pub fn data(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    pub fn chunk(&self) -> Chunk {
        self.chunk
    }

    pub fn set_chunk(&mut self, chunk: Chunk) {
        self.chunk = chunk;
    }

    /// The valid part of the region described by the chunk, clamped to the
    /// region bounds
    pub fn payload(&self) -> &[u8] {
        let data = self.region.as_slice();
        let offset = (self.chunk.offset as usize).min(data.len());
        let size = (self.chunk.size as usize).min(data.len() - offset);
        &data[offset..offset + size]
    }

    pub fn ring_meta(&self) -> Option<&RingCursors> {
        self.ring.as_ref()
    }

    pub fn ring_meta_mut(&mut self) -> Option<&mut RingCursors> {
        self.ring.as_mut()
    }
}

/// Bounded set of reusable buffers for one port
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
    free: VecDeque<u32>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool contents with the given buffers.
    ///
    /// Every buffer is validated and mapped first; on failure the pool is
    /// left unchanged and previously acquired mappings are released.
    pub fn use_buffers(
        &mut self,
        descriptors: Vec<BufferDescriptor>,
        mapper: Option<&dyn MemoryMapper>,
    ) -> EngineResult<()> {
        let mut buffers: Vec<Buffer> = Vec::with_capacity(descriptors.len());

        for desc in descriptors {
            if buffers.iter().any(|b| b.id == desc.id) || desc.id == INVALID_ID {
                return Err(EngineError::InvalidBuffer {
                    buffer_id: desc.id,
                    reason: "duplicate or reserved id".to_string(),
                });
            }

            let region = Self::acquire_region(desc.id, desc.data, mapper)?;
            debug!(buffer_id = desc.id, size = region.as_slice().len(), "got buffer");

            buffers.push(Buffer {
                id: desc.id,
                region,
                chunk: Chunk::default(),
                ring: desc.ring_meta.then(RingCursors::new),
                state: BufferState::Free,
            });
        }

        self.free = buffers.iter().map(|b| b.id).collect();
        self.buffers = buffers;
        Ok(())
    }

    fn acquire_region(
        id: u32,
        data: BufferData,
        mapper: Option<&dyn MemoryMapper>,
    ) -> EngineResult<Region> {
        if let Some(memory) = data.memory {
            return Ok(Region::Host(memory));
        }

        match (data.data_type, data.fd) {
            (DataType::MemFd | DataType::DmaBuf, Some(fd)) => {
                let mapper = mapper.ok_or_else(|| EngineError::InvalidBuffer {
                    buffer_id: id,
                    reason: "no memory mapper available".to_string(),
                })?;
                let region = mapper.map(data.data_type, fd, data.map_offset, data.max_size).map_err(|e| {
                    error!(buffer_id = id, "failed to map buffer memory: {}", e);
                    EngineError::InvalidBuffer {
                        buffer_id: id,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Region::Mapped(region))
            }
            _ => {
                error!(buffer_id = id, "invalid buffer memory");
                Err(EngineError::InvalidBuffer {
                    buffer_id: id,
                    reason: format!("unusable memory type {:?}", data.data_type),
                })
            }
        }
    }

    /// Drop all buffers (and their mappings)
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.free.clear();
    }

    /// Take the next free buffer, marking it in flight
    pub fn dequeue(&mut self) -> Option<u32> {
        let id = self.free.pop_front()?;
        if let Some(buffer) = self.get_mut(id) {
            buffer.state = BufferState::InFlight;
        }
        Some(id)
    }

    /// Return a buffer to the free list.
    ///
    /// Reusing a buffer that is already free is a no-op and returns
    /// `Ok(false)`.
    pub fn reuse(&mut self, id: u32) -> EngineResult<bool> {
        let buffer = self.get_mut(id).ok_or_else(|| EngineError::InvalidBuffer {
            buffer_id: id,
            reason: "unknown buffer id".to_string(),
        })?;

        if buffer.state == BufferState::Free {
            return Ok(false);
        }
        buffer.state = BufferState::Free;
        self.free.push_back(id);
        trace!(buffer_id = id, "recycle buffer");
        Ok(true)
    }

    pub fn get(&self, id: u32) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Buffer> {
        self.buffers.iter_mut().find(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
