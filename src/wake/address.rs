//! Hardware address and wake request decoding
//!
//! Turns the raw bytes of an inbound bus message into a validated
//! [`WakeRequest`]. Nothing in here touches the network.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while decoding an inbound wake request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The hardware address is not six uniformly separated hex octets
    #[error("malformed-address: {0}")]
    MalformedAddress(String),

    /// The payload is not a JSON object carrying a `mac` string
    #[error("malformed-payload: {0}")]
    MalformedPayload(String),
}

impl DecodeError {
    /// Stable reason tag, independent of the diagnostic detail
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::MalformedAddress(_) => "malformed-address",
            DecodeError::MalformedPayload(_) => "malformed-payload",
        }
    }
}

/// A six-byte device identifier
///
/// Accepts `AA:BB:CC:DD:EE:FF` or `aa-bb-cc-dd-ee-ff` on input and always
/// displays as uppercase hex joined by `:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::MalformedAddress(raw.to_string());

        let separator = if raw.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = raw.split(separator).collect();
        if parts.len() != 6 {
            return Err(malformed());
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            // from_str_radix tolerates a leading '+', so check the digits first
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }

        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for HardwareAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// A decoded request to wake one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeRequest {
    pub target_address: HardwareAddress,
    /// Advisory name of the device, empty when the sender gave none
    pub label: String,
}

/// Wire shape of the inbound JSON payload
#[derive(Deserialize)]
struct WakeMessage {
    #[serde(rename = "mac")]
    mac: String,
    #[serde(rename = "name", default)]
    name: Option<String>,
}

/// Decodes a bus payload into a [`WakeRequest`]
///
/// Invalid JSON, a non-object body or a missing `mac` field yields
/// [`DecodeError::MalformedPayload`]. A `mac` that is present but not a
/// valid address yields [`DecodeError::MalformedAddress`].
pub fn decode_request(payload: &[u8]) -> Result<WakeRequest, DecodeError> {
    let malformed = |e: serde_json::Error| DecodeError::MalformedPayload(e.to_string());

    // Derived struct deserialization would also take a JSON array in field order
    let object: Map<String, Value> = serde_json::from_slice(payload).map_err(malformed)?;
    let message: WakeMessage = serde_json::from_value(Value::Object(object)).map_err(malformed)?;

    let target_address = HardwareAddress::parse(&message.mac)?;

    Ok(WakeRequest {
        target_address,
        label: message.name.unwrap_or_default(),
    })
}
