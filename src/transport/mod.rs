//! UDP transport: one bound socket feeding and draining the packet bus.
//!
//! The read loop publishes every datagram to the `incoming` topic and
//! returns to the socket immediately. Two drain loops subscribe to the
//! outbound topics: `outgoing` messages carry their destination,
//! `outgoing-noaddr` bursts are resolved through the session store at
//! delivery time. A failed send is logged and never kills the server; only
//! the startup bind is fatal.

mod socket;

pub use socket::{create_udp_socket, SocketConfig};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::{PacketBus, RawPacket};
use crate::error::{Result, TransportError};
use crate::protocol::MAX_DATAGRAM;
use crate::store::SessionStore;

/// The DMR UDP transport.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the socket. The only fatal failure in the server.
    pub fn bind(addr: SocketAddr, config: &SocketConfig) -> Result<Self> {
        let std_socket = create_udp_socket(addr, config)?;

        let socket = UdpSocket::from_std(std_socket.into()).map_err(|e| {
            TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }

    /// Spawn the read loop and the two send loops.
    pub fn start(
        &self,
        bus: Arc<PacketBus>,
        store: Arc<SessionStore>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_read_loop(Arc::clone(&bus), shutdown.subscribe()),
            self.spawn_send_loop(Arc::clone(&bus), shutdown.subscribe()),
            self.spawn_send_noaddr_loop(bus, store, shutdown.subscribe()),
        ]
    }

    fn spawn_read_loop(
        &self,
        bus: Arc<PacketBus>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, addr)) => {
                            trace!("Read {len} bytes from {addr}");
                            bus.publish_incoming(RawPacket {
                                addr,
                                data: buf[..len].to_vec(),
                            });
                        }
                        Err(e) => {
                            warn!("Error reading from UDP socket, swallowing: {e}");
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("UDP read loop stopped");
        })
    }

    fn spawn_send_loop(
        &self,
        bus: Arc<PacketBus>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let mut rx = bus.subscribe_outgoing();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = rx.recv() => match result {
                        Ok(packet) => {
                            if let Err(e) = socket.send_to(&packet.data, packet.addr).await {
                                warn!("Error sending to {}: {e}", packet.addr);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Outgoing send loop lagged, dropped {n} packets");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("UDP send loop stopped");
        })
    }

    fn spawn_send_noaddr_loop(
        &self,
        bus: Arc<PacketBus>,
        store: Arc<SessionStore>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let mut rx = bus.subscribe_unaddressed();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = rx.recv() => match result {
                        Ok(packet) => {
                            let Some(session) = store.get(packet.repeater) else {
                                warn!(
                                    "No session for repeater {}, dropping burst",
                                    packet.repeater
                                );
                                continue;
                            };
                            let addr = session.addr();
                            if let Err(e) = socket.send_to(&packet.encode(), addr).await {
                                warn!("Error sending burst to {addr}: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Unaddressed send loop lagged, dropped {n} packets");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("UDP unaddressed send loop stopped");
        })
    }
}
