//! Wake dispatcher: fans one magic packet out over the broadcast targets

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::address::HardwareAddress;
use super::packet::{MagicPacket, Transmitter};

/// Standard wake-on-LAN port (discard)
pub const DISCARD_PORT: u16 = 9;
/// Secondary port some NICs listen on (echo)
pub const ECHO_PORT: u16 = 7;

pub const DEFAULT_BROADCAST_HOST: &str = "255.255.255.255";

/// A host to broadcast the magic packet to
///
/// Without an explicit port the packet goes to port 9 and then port 7.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BroadcastTarget {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl BroadcastTarget {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        match self.port {
            Some(port) => vec![port],
            None => vec![DISCARD_PORT, ECHO_PORT],
        }
    }
}

impl Default for BroadcastTarget {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_HOST, None)
    }
}

/// Result of a single transmission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeOutcome {
    /// `host:port` the packet was addressed to
    pub target: String,
    pub succeeded: bool,
    pub error_detail: Option<String>,
}

impl fmt::Display for WakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.succeeded, &self.error_detail) {
            (true, _) => write!(f, "{} ok", self.target),
            (false, Some(detail)) => write!(f, "{} failed: {}", self.target, detail),
            (false, None) => write!(f, "{} failed", self.target),
        }
    }
}

/// Sends magic packets through a [`Transmitter`]
///
/// Holds no mutable state, so one instance can be shared across delivery
/// tasks.
#[derive(Clone)]
pub struct WakeDispatcher {
    transmitter: Arc<dyn Transmitter>,
}

impl WakeDispatcher {
    pub fn new(transmitter: Arc<dyn Transmitter>) -> Self {
        Self { transmitter }
    }

    /// Transmits one packet per target port, in order
    ///
    /// A failed send is recorded and the remaining targets are still tried.
    pub fn dispatch(
        &self,
        address: HardwareAddress,
        targets: &[BroadcastTarget],
    ) -> Vec<WakeOutcome> {
        let packet = MagicPacket::new(address);
        let mut outcomes = Vec::with_capacity(targets.len() * 2);

        for target in targets {
            for port in target.ports() {
                let label = format!("{}:{}", target.host, port);
                debug!("Transmitting magic packet for {} to {}", address, label);

                let outcome = match self.transmitter.transmit(&packet, &target.host, port) {
                    Ok(()) => WakeOutcome {
                        target: label,
                        succeeded: true,
                        error_detail: None,
                    },
                    Err(e) => WakeOutcome {
                        target: label,
                        succeeded: false,
                        error_detail: Some(e.to_string()),
                    },
                };
                outcomes.push(outcome);
            }
        }

        outcomes
    }
}
