//! Packet transport seam
//!
//! The sync engine hands finished packets to a [`PacketSink`] as a list of
//! slices (header, then up to two ring regions) and never waits on it.
//! [`UdpTransport`] is the UDP implementation used by the daemon.
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
use bytes::BytesMut;
use std::io::{ErrorKind, IoSlice};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Largest datagram we send or accept
pub const MAX_PACKET_SIZE: usize = 1500;

/// Receives finished packets from the engine
pub trait PacketSink {
    /// Send one packet made of the concatenation of `iov`. Must not block.
    fn send_packet(&mut self, iov: &[IoSlice<'_>]) -> EngineResult<()>;
}

/// Collects packets in memory
impl PacketSink for Vec<Vec<u8>> {
    fn send_packet(&mut self, iov: &[IoSlice<'_>]) -> EngineResult<()> {
        self.push(iov.iter().flat_map(|s| s.iter().copied()).collect());
        Ok(())
    }
}

/// UDP socket carrying one RTP stream
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    scratch: BytesMut,
}

impl UdpTransport {
    /// Bind a socket on `local`. `peer` is the destination for sent packets.
    pub async fn bind(local: SocketAddr, peer: Option<SocketAddr>) -> EngineResult<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| EngineError::NetworkError(format!("Failed to bind UDP {}: {}", local, e)))?;
        info!(local = %socket.local_addr()?, peer = ?peer, "UDP transport bound");

        Ok(UdpTransport {
            socket,
            peer,
            scratch: BytesMut::with_capacity(MAX_PACKET_SIZE),
        })
    }

    pub fn local_addr(&self) -> EngineResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    /// Wait for the next datagram
    pub async fn recv<'a>(&self, buf: &'a mut [u8]) -> EngineResult<(&'a [u8], SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        Ok((&buf[..len], from))
    }
}

impl PacketSink for UdpTransport {
    fn send_packet(&mut self, iov: &[IoSlice<'_>]) -> EngineResult<()> {
        let peer = self
            .peer
            .ok_or_else(|| EngineError::NetworkError("no destination address".to_string()))?;

        self.scratch.clear();
        for slice in iov {
            self.scratch.extend_from_slice(slice);
        }

        match self.socket.try_send_to(&self.scratch, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                // socket buffer full: the datagram is lost like any other
                debug!(%peer, "send would block, dropping packet");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
