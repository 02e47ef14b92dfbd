//! Fixed-capacity circular byte store with monotonic cursors
//!
//! Cursors are free-running 32-bit counters. Only the physical offset wraps
//! (`offset & mask`), so `write_index - read_index` is always the number of
//! units resident in the ring, even across `u32` overflow.
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

/// Read/write cursor pair.
///
/// The unit of the cursors is chosen by the owner (samples for the RTP
/// streams, bytes for buffer metadata). The producer only moves
/// `write_index`, the consumer only moves `read_index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursors {
    read_index: u32,
    write_index: u32,
}

impl RingCursors {
    /// Create a cursor pair at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(filled, write_index)`
    pub fn get_write_index(&self) -> (i32, u32) {
        (self.write_index.wrapping_sub(self.read_index) as i32, self.write_index)
    }

    /// Returns `(avail, read_index)`
    pub fn get_read_index(&self) -> (i32, u32) {
        (self.write_index.wrapping_sub(self.read_index) as i32, self.read_index)
    }

    /// Publish a new write cursor
    pub fn write_update(&mut self, index: u32) {
        self.write_index = index;
    }

    /// Publish a new read cursor
    pub fn read_update(&mut self, index: u32) {
        self.read_index = index;
    }

    /// Re-anchor both cursors
    pub fn set(&mut self, read_index: u32, write_index: u32) {
        self.read_index = read_index;
        self.write_index = write_index;
    }

    pub fn read_index(&self) -> u32 {
        self.read_index
    }

    pub fn write_index(&self) -> u32 {
        self.write_index
    }
}

/// Circular byte buffer addressed by [`RingCursors`].
///
/// All methods take `&mut self` or `&self`: the producer (network callback)
/// and the consumer (graph cycle) of one stream run as non-overlapping
/// phases of the same loop, so cursor publication is a plain store.
#[derive(Debug)]
pub struct RingBuffer {
    cursors: RingCursors,
    data: Vec<u8>,
    mask: u32,
}

impl RingBuffer {
    /// Allocate a zeroed ring of `size` bytes. `size` must be a power of two.
    pub fn new(size: usize) -> EngineResult<Self> {
        if size == 0 || !size.is_power_of_two() || size > (1 << 31) {
            return Err(EngineError::ConfigError(format!(
                "Ring size must be a power of two <= 2^31, got {}",
                size
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            EngineError::AllocationFailed(format!("ring buffer of {} bytes: {}", size, e))
        })?;
        data.resize(size, 0);

        Ok(RingBuffer {
            cursors: RingCursors::new(),
            data,
            mask: (size - 1) as u32,
        })
    }

    /// Capacity in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Physical byte offset of a cursor position for a given frame stride
    pub fn byte_offset(&self, index: u32, stride: u32) -> u32 {
        index.wrapping_mul(stride) & self.mask
    }

    pub fn get_write_index(&self) -> (i32, u32) {
        self.cursors.get_write_index()
    }

    pub fn get_read_index(&self) -> (i32, u32) {
        self.cursors.get_read_index()
    }

    pub fn write_update(&mut self, index: u32) {
        self.cursors.write_update(index);
    }

    pub fn read_update(&mut self, index: u32) {
        self.cursors.read_update(index);
    }

    /// Re-anchor the cursors without touching the contents
    pub fn set_indices(&mut self, read_index: u32, write_index: u32) {
        self.cursors.set(read_index, write_index);
    }

    pub fn cursors(&self) -> RingCursors {
        self.cursors
    }

    /// Copy `src` into the ring starting at byte `offset`, wrapping once if
    /// needed. The caller has already checked that the write cannot overrun.
    pub fn write_data(&mut self, src: &[u8], offset: u32) {
        debug_assert!(src.len() <= self.data.len());
        let offset = (offset & self.mask) as usize;
        let first = src.len().min(self.data.len() - offset);

        self.data[offset..offset + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            let rest = src.len() - first;
            self.data[..rest].copy_from_slice(&src[first..]);
        }
    }

    /// Copy `dst.len()` bytes out of the ring starting at byte `offset`
    pub fn read_data(&self, dst: &mut [u8], offset: u32) {
        debug_assert!(dst.len() <= self.data.len());
        let offset = (offset & self.mask) as usize;
        let first = dst.len().min(self.data.len() - offset);

        dst[..first].copy_from_slice(&self.data[offset..offset + first]);
        if first < dst.len() {
            let rest = dst.len() - first;
            dst[first..].copy_from_slice(&self.data[..rest]);
        }
    }

    /// The region `[offset, offset + len)` as at most two contiguous slices,
    /// split at the end of the ring.
    pub fn slices(&self, offset: u32, len: usize) -> (&[u8], &[u8]) {
        debug_assert!(len <= self.data.len());
        let offset = (offset & self.mask) as usize;
        let first = len.min(self.data.len() - offset);

        (&self.data[offset..offset + first], &self.data[..len - first])
    }

    /// Zero the contents
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(matches!(RingBuffer::new(1000), Err(EngineError::ConfigError(_))));
        assert!(matches!(RingBuffer::new(0), Err(EngineError::ConfigError(_))));
        assert!(RingBuffer::new(1024).is_ok());
    }

    #[test]
    fn test_write_read_across_wrap() {
        let mut ring = RingBuffer::new(16).unwrap();
        let mut expected = Vec::new();
        let mut read_back = Vec::new();

        // 5 writes of 6 bytes with reads in between walk over the boundary twice
        for round in 0..5u8 {
            let chunk: Vec<u8> = (0..6).map(|i| round * 10 + i).collect();
            let (filled, write) = ring.get_write_index();
            assert!(filled as usize + chunk.len() <= 16);
            ring.write_data(&chunk, ring.byte_offset(write, 1));
            ring.write_update(write.wrapping_add(chunk.len() as u32));
            expected.extend_from_slice(&chunk);

            let (avail, read) = ring.get_read_index();
            let mut out = vec![0u8; avail as usize];
            ring.read_data(&mut out, ring.byte_offset(read, 1));
            ring.read_update(read.wrapping_add(avail as u32));
            read_back.extend_from_slice(&out);
        }

        assert_eq!(expected, read_back);
    }

    #[test]
    fn test_filled_survives_counter_overflow() {
        let mut ring = RingBuffer::new(64).unwrap();
        ring.set_indices(u32::MAX - 10, u32::MAX - 10);

        let data = [7u8; 32];
        let (_, write) = ring.get_write_index();
        ring.write_data(&data, ring.byte_offset(write, 1));
        ring.write_update(write.wrapping_add(32));

        let (filled, write) = ring.get_write_index();
        assert_eq!(filled, 32);
        assert_eq!(write, 21);

        let (avail, read) = ring.get_read_index();
        assert_eq!(avail, 32);
        let mut out = [0u8; 32];
        ring.read_data(&mut out, ring.byte_offset(read, 1));
        assert_eq!(out, data);
    }

    #[test]
    fn test_slices_split_at_end() {
        let mut ring = RingBuffer::new(8).unwrap();
        ring.write_data(&[1, 2, 3, 4, 5], 6);

        let (a, b) = ring.slices(6, 5);
        assert_eq!(a, &[1, 2]);
        assert_eq!(b, &[3, 4, 5]);

        let (a, b) = ring.slices(0, 4);
        assert_eq!(a, &[3, 4, 5, 0]);
        assert!(b.is_empty());
    }

    #[test]
    fn test_clear_zeroes_contents() {
        let mut ring = RingBuffer::new(8).unwrap();
        ring.write_data(&[9; 8], 0);
        ring.clear();
        let mut out = [1u8; 8];
        ring.read_data(&mut out, 0);
        assert_eq!(out, [0; 8]);
    }
}
