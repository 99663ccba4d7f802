//! In-process packet bus decoupling the socket task from the workers.
//!
//! Three named topics with publish/subscribe semantics:
//!
//! - `incoming`: raw datagrams received from the socket
//! - `outgoing`: datagrams pre-addressed with a destination
//! - `outgoing-noaddr`: logical bursts whose destination is resolved at
//!   delivery time by looking up the repeater id in the session store
//!
//! Delivery is best-effort with per-subscriber FIFO ordering and no
//! durability: a lagging subscriber loses the oldest messages and
//! in-flight packets die with the process. DMR is realtime, so neither
//! matters.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::protocol::DmrPacket;

/// Default per-topic channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A raw datagram paired with its remote address.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

/// The three named topics.
pub struct PacketBus {
    incoming: broadcast::Sender<RawPacket>,
    outgoing: broadcast::Sender<RawPacket>,
    outgoing_noaddr: broadcast::Sender<DmrPacket>,
}

impl PacketBus {
    /// Create a bus with the given per-topic capacity.
    pub fn new(capacity: usize) -> Self {
        let (incoming, _) = broadcast::channel(capacity);
        let (outgoing, _) = broadcast::channel(capacity);
        let (outgoing_noaddr, _) = broadcast::channel(capacity);

        Self {
            incoming,
            outgoing,
            outgoing_noaddr,
        }
    }

    /// Publish a received datagram.
    pub fn publish_incoming(&self, packet: RawPacket) {
        let _ = self.incoming.send(packet);
    }

    /// Subscribe to received datagrams.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<RawPacket> {
        self.incoming.subscribe()
    }

    /// Publish a pre-addressed datagram for transmission.
    pub fn publish_outgoing(&self, packet: RawPacket) {
        let _ = self.outgoing.send(packet);
    }

    /// Subscribe to pre-addressed datagrams.
    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<RawPacket> {
        self.outgoing.subscribe()
    }

    /// Publish a burst whose destination is resolved at delivery time.
    pub fn publish_unaddressed(&self, packet: DmrPacket) {
        let _ = self.outgoing_noaddr.send(packet);
    }

    /// Subscribe to unaddressed bursts.
    pub fn subscribe_unaddressed(&self) -> broadcast::Receiver<DmrPacket> {
        self.outgoing_noaddr.subscribe()
    }
}

impl Default for PacketBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
