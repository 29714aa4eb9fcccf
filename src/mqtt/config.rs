use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "wake_on_lan_mqtt";
pub const DEFAULT_TOPIC: &str = "/wake_on_lan";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed broker endpoint {endpoint:?}: {reason}")]
pub struct EndpointError {
    pub endpoint: String,
    pub reason: &'static str,
}

/// Host and port of the MQTT broker
///
/// Accepts `tcp://host:port`, `mqtt://host:port` or a bare `host[:port]`.
/// The port defaults to 1883.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let error = |reason| EndpointError {
            endpoint: raw.to_string(),
            reason,
        };

        let raw_trimmed = raw.trim();
        let authority = match raw_trimmed.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => rest,
                _ => return Err(error("unsupported scheme, expected tcp or mqtt")),
            },
            None => raw_trimmed,
        };
        let authority = authority.trim_end_matches('/');

        if authority.is_empty() {
            return Err(error("missing host"));
        }
        if authority.contains(['/', '@', '?', ' ']) {
            return Err(error("unexpected path, credentials or query"));
        }

        let (host, port) = match authority.rsplit_once(':') {
            // IPv6 literals keep their colons inside brackets
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| error("invalid port"))?;
                (host, port)
            }
            _ => (authority, DEFAULT_MQTT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.is_empty() {
            return Err(error("missing host"));
        }
        if port == 0 {
            return Err(error("invalid port"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// Everything the bus session needs to connect and subscribe
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub broker: BrokerEndpoint,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect_pause: Duration,
}

impl MqttConfig {
    pub fn new(broker: BrokerEndpoint) -> Self {
        Self {
            broker,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_millis(250),
            reconnect_pause: Duration::from_secs(1),
        }
    }
}
