//! Address-tagged datagram buffer
//!
//! One inbound or outbound UDP datagram together with the local and peer
//! socket addresses it travelled between. A `Datagram` has exactly one owner
//! at a time: the receive path hands it to the codec, the encode path hands it
//! to the transport, which consumes it on send.
use bytes::BytesMut;
use std::net::SocketAddr;

/// Largest datagram the transport reads in one call (Ethernet MTU)
pub const MAX_DATAGRAM_SIZE: usize = 1500;

#[derive(Debug)]
pub struct Datagram {
    payload: BytesMut,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Datagram {
    /// Receive-side buffer sized to the transport maximum
    pub fn for_receive(local: SocketAddr) -> Self {
        Self {
            payload: BytesMut::zeroed(MAX_DATAGRAM_SIZE),
            local,
            peer: local,
        }
    }

    /// Send-side buffer holding an already encoded packet
    pub fn outbound(payload: BytesMut, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            payload,
            local,
            peer,
        }
    }

    /// Shrink to the number of bytes actually received and record the sender
    pub fn truncate_received(&mut self, len: usize, peer: SocketAddr) {
        self.payload.truncate(len);
        self.peer = peer;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}
