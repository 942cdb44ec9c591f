//! Low-level UDP socket handling
//!
//! Both sockets are built through socket2 so buffer sizes can be set before
//! binding, then converted to std sockets for the I/O threads.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Create the outbound socket on an ephemeral local port
///
/// The address family follows `target`. The socket is non-blocking: a send
/// that would block is reported as an error and the datagram is dropped.
pub fn create_send_socket(config: &NetworkConfig, target: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let local = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };

    let socket = new_socket(local)?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    bind(&socket, local)?;

    let socket: UdpSocket = socket.into();
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket)
}

/// Create the inbound socket bound to `addr`
///
/// Blocking with a read timeout, so the receive loop wakes up at least once
/// per `timeout` to check its stop flag.
pub fn create_recv_socket(
    config: &NetworkConfig,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(addr)?;

    if config.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    // Larger buffers handle burst traffic better
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    bind(&socket, addr)?;

    let socket: UdpSocket = socket.into();
    // A zero timeout would mean "block forever"
    socket
        .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket)
}

fn new_socket(addr: SocketAddr) -> Result<Socket, NetworkError> {
    Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}

fn bind(socket: &Socket, addr: SocketAddr) -> Result<(), NetworkError> {
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))
}
