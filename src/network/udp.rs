//! UDP audio transport

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::AudioTransport;
use crate::error::NetworkError;

/// Kernel send buffer requested for audio sockets
const SEND_BUFFER_BYTES: usize = 256 * 1024;

/// Create an unconnected UDP socket suitable for sending to `target`.
pub fn create_socket(target: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Larger buffer rides out short scheduling hiccups; not fatal if refused
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        tracing::debug!("Could not set UDP send buffer size: {}", e);
    }

    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket
        .bind(&local.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

/// Sends each packet as one datagram to a fixed target
pub struct UdpAudioSender {
    socket: UdpSocket,
    target: SocketAddr,
    packets_sent: u64,
}

impl UdpAudioSender {
    /// Open a sending socket for `target`
    pub fn new(target: SocketAddr) -> Result<Self, NetworkError> {
        Ok(Self {
            socket: create_socket(target)?,
            target,
            packets_sent: 0,
        })
    }

    /// Packets handed to the kernel so far
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }
}

impl AudioTransport for UdpAudioSender {
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        self.socket
            .send_to(packet, self.target)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.packets_sent += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.target)
    }
}
