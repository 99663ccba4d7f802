//! Low-level socket creation with buffer tuning.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, TransportError};

/// Socket configuration options.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 1024 * 1024,
            recv_buffer_size: 1024 * 1024,
            reuse_addr: true,
        }
    }
}

/// Create a UDP socket with tuned buffers, bound and non-blocking.
pub fn create_udp_socket(addr: SocketAddr, config: &SocketConfig) -> Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set send buffer: {e}")))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;

    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse addr: {e}")))?;
    }

    // For IPv6, allow IPv4 mapped addresses
    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    socket.bind(&addr.into()).map_err(|e| {
        TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        }
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_udp_socket(addr, &SocketConfig::default()).unwrap();
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = SocketConfig {
            reuse_addr: false,
            ..Default::default()
        };
        let first = create_udp_socket(addr, &config).unwrap();
        let taken = first.local_addr().unwrap().as_socket().unwrap();

        let result = create_udp_socket(taken, &config);
        assert!(matches!(
            result,
            Err(crate::Error::Transport(TransportError::BindFailed { .. }))
        ));
    }
}
