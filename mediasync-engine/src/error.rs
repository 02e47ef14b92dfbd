//! Error types for the streaming engine
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


use crate::node::Direction;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the streaming engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Proposed format is not in the supported set or cannot be parsed
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Provided buffer is unmapped, wrongly typed or unknown
    #[error("Invalid buffer {buffer_id}: {reason}")]
    InvalidBuffer { buffer_id: u32, reason: String },

    /// Operation not supported by this node
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Port does not exist on this node
    #[error("Invalid port: {direction:?} {port_id}")]
    InvalidPort { direction: Direction, port_id: u32 },

    /// Port has no negotiated format
    #[error("No format negotiated on port {port_id}")]
    NoFormat { port_id: u32 },

    /// Port has no buffers provided
    #[error("No buffers provided on port {port_id}")]
    NoBuffers { port_id: u32 },

    /// No free buffer is available (backpressure, not a failure)
    #[error("Out of buffers")]
    OutOfBuffers,

    /// Short packet, bad version or inconsistent lengths
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Packet from a source other than the one we are locked to
    #[error("Unexpected source: expected SSRC {expected}, got {got}")]
    UnexpectedSource { expected: u32, got: u32 },

    /// Ring or dither storage could not be allocated
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),
}

impl EngineError {
    /// True for the expected flow-control condition the host should absorb.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EngineError::OutOfBuffers)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::NetworkError(err.to_string())
    }
}
