//! # Wake-on-LAN Module
//!
//! Everything between a decoded bus payload and the UDP datagram that wakes
//! the device:
//!
//! ```text
//! wake/
//! ├── address.rs     - hardware address parsing and payload decoding
//! ├── packet.rs      - magic packet layout and the UDP transmitter
//! └── dispatcher.rs  - per-target fan-out and outcome reporting
//! ```
//!
//! Transmission sits behind the [`packet::Transmitter`] trait so the
//! dispatcher can be driven by a fault-injecting double in tests.

pub mod address;
pub mod dispatcher;
pub mod packet;

pub use address::{decode_request, DecodeError, HardwareAddress, WakeRequest};
pub use dispatcher::{BroadcastTarget, WakeDispatcher, WakeOutcome};
pub use packet::{MagicPacket, Transmitter, UdpTransmitter};
