//! Magic packet construction and UDP transmission

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use tracing::debug;

use super::address::HardwareAddress;

const SYNC_STREAM_LEN: usize = 6;
const ADDRESS_REPEATS: usize = 16;

/// Length of a magic packet without a SecureOn trailer
pub const MAGIC_PACKET_LEN: usize = SYNC_STREAM_LEN + ADDRESS_REPEATS * 6;

/// A wake-on-LAN frame: six `0xFF` bytes followed by the target address
/// repeated sixteen times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket {
    bytes: [u8; MAGIC_PACKET_LEN],
}

impl MagicPacket {
    pub fn new(address: HardwareAddress) -> Self {
        let mut bytes = [0xFF; MAGIC_PACKET_LEN];
        let octets = address.octets();
        for chunk in bytes[SYNC_STREAM_LEN..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&octets);
        }
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Sends a magic packet to a single `host:port`
///
/// Implementations are fire-and-forget: success means the datagram was
/// handed to the OS, not that the device woke up.
pub trait Transmitter: Send + Sync {
    fn transmit(&self, packet: &MagicPacket, host: &str, port: u16) -> io::Result<()>;
}

/// Transmitter backed by a fresh broadcast-enabled UDP socket per send
#[derive(Debug, Clone, Default)]
pub struct UdpTransmitter;

impl Transmitter for UdpTransmitter {
    fn transmit(&self, packet: &MagicPacket, host: &str, port: u16) -> io::Result<()> {
        let destination = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host} did not resolve to an address"),
            )
        })?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_broadcast(true)?;
        let sent = socket.send_to(packet.as_bytes(), destination)?;
        debug!("Sent {} byte magic packet to {}", sent, destination);

        if sent != MAGIC_PACKET_LEN {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {sent} of {MAGIC_PACKET_LEN} bytes"),
            ));
        }
        Ok(())
    }
}
