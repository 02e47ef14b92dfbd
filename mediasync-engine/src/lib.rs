//! Buffered streaming engine
//!
//! This crate provides the core of the media sync service:
//! - Single-producer/single-consumer ring buffers with wrapping cursors
//! - The node/port contract: format negotiation, buffer pools, processing
//! - A delay-locked loop for clock drift compensation
//! - RTP framing and stream synchronization on both ends
//!
//! # Threading
//!
//! Producer and consumer of a stream run in separate phases of the same
//! scheduler tick, so cursors are plain values mutated through `&mut self`.
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


pub mod error;
pub mod ring_buffer;
pub mod dll;
pub mod format;
pub mod buffer_pool;
pub mod node;
pub mod sample_convert;
pub mod rtp_handler;
pub mod rtp_stream;
pub mod transport;
pub mod sine_source;
pub mod rtp_nodes;

// Re-export main types
pub use error::{EngineError, EngineResult};
pub use ring_buffer::{RingBuffer, RingCursors};
pub use dll::{Dll, DllConfig, DLL_BW_MAX, DLL_BW_MIN};
pub use format::{
    AudioInfo, Choice, Format, FormatDescriptor, FormatProperty, MediaSubtype, MediaType,
    SampleFormat, VideoInfo,
};
pub use buffer_pool::{
    Buffer, BufferData, BufferDescriptor, BufferPool, BufferState, Chunk, DataType,
    MappedRegion, MemoryMapper, INVALID_ID,
};
pub use node::{
    BufferRequirements, Direction, FormatEnumerator, IoStatus, Node, NodeInfo, NodeRole, Port,
    PortIo, PortState, ProcessStatus,
};
pub use sample_convert::{select_converter, DitherConfig, SampleConverter};
pub use rtp_handler::{RtpHeader, RtpPacket};
pub use rtp_stream::{
    PullOutcome, ReceiveOutcome, RtpReceiver, RtpSender, StreamConfig, StreamStats, SyncState,
};
pub use transport::{PacketSink, UdpTransport, MAX_PACKET_SIZE};
pub use sine_source::SineSource;
pub use rtp_nodes::{RtpSinkNode, RtpSourceNode};
