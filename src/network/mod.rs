//! Network subsystem: audio packet transports and the duplex control client

pub mod udp;
pub mod websocket;

pub use udp::{create_socket, UdpAudioSender};
pub use websocket::{
    ByteSink, ClientHandle, ClientMode, ConnectionState, DuplexClient, JsonHandler,
};

use crate::error::NetworkError;

/// Best-effort sink for fixed-size audio packets.
///
/// Called from a voice's send thread once per packet interval; it must not
/// block for longer than a send syscall.
pub trait AudioTransport: Send {
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError>;

    /// Destination, for logs
    fn describe(&self) -> String;
}
