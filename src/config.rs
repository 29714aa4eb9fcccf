//! Process configuration
//!
//! The broker endpoint always comes from `MQTT_SERVER`. Everything else has
//! a default and can be overridden from a TOML file and, for the client id
//! and topic, from the environment:
//!
//! ```toml
//! client_id = "wake_on_lan_mqtt"
//! topic = "/wake_on_lan"
//! disconnect_timeout_ms = 250
//!
//! [[targets]]
//! host = "192.168.1.255"
//!
//! [[targets]]
//! host = "10.0.0.255"
//! port = 9
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::mqtt::config::{BrokerEndpoint, EndpointError, MqttConfig};
use crate::wake::BroadcastTarget;

pub const SERVER_ENV: &str = "MQTT_SERVER";
pub const CONFIG_PATH_ENV: &str = "WOL_BRIDGE_CONFIG";
pub const CLIENT_ID_ENV: &str = "MQTT_CLIENT_ID";
pub const TOPIC_ENV: &str = "MQTT_TOPIC";

const CONFIG_DIR: &str = ".config/wake-on-lan-mqtt";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing MQTT_SERVER environment variable")]
    MissingServer,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("unable to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Optional settings read from the TOML file
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub client_id: Option<String>,
    pub topic: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub subscribe_timeout_ms: Option<u64>,
    pub disconnect_timeout_ms: Option<u64>,
    pub reconnect_pause_ms: Option<u64>,
    pub targets: Option<Vec<BroadcastTarget>>,
}

impl FileConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Fully resolved configuration of the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub targets: Vec<BroadcastTarget>,
}

impl BridgeConfig {
    /// Reads the process environment and the config file, if any
    pub async fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();

        // Endpoint problems are reported before any file access
        let broker = broker_from(&lookup)?;

        let file = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Some(read_file(Path::new(&path)).await?),
            None => match default_config_path() {
                Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                    Some(read_file(&path).await?)
                }
                _ => None,
            },
        };

        Self::resolve(broker, &lookup, file.unwrap_or_default())
    }

    /// Builds the configuration from an arbitrary variable source
    pub fn from_sources<L>(lookup: L, file: FileConfig) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let broker = broker_from(&lookup)?;
        Self::resolve(broker, &lookup, file)
    }

    fn resolve<L>(broker: BrokerEndpoint, lookup: &L, file: FileConfig) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut mqtt = MqttConfig::new(broker);

        if let Some(client_id) = lookup(CLIENT_ID_ENV).or(file.client_id) {
            mqtt.client_id = client_id;
        }
        if let Some(topic) = lookup(TOPIC_ENV).or(file.topic) {
            mqtt.topic = topic;
        }
        if let Some(secs) = file.keep_alive_secs {
            mqtt.keep_alive = Duration::from_secs(secs);
        }
        if let Some(ms) = file.connect_timeout_ms {
            mqtt.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.subscribe_timeout_ms {
            mqtt.subscribe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.disconnect_timeout_ms {
            mqtt.disconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.reconnect_pause_ms {
            mqtt.reconnect_pause = Duration::from_millis(ms);
        }

        let targets = file
            .targets
            .unwrap_or_else(|| vec![BroadcastTarget::default()]);

        let config = Self { mqtt, targets };
        config.validate()?;
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| ConfigError::Invalid {
            key,
            reason: reason.to_string(),
        };

        if self.mqtt.client_id.is_empty() || self.mqtt.client_id.starts_with(' ') {
            return Err(invalid("client_id", "must not be empty or start with a space"));
        }
        if self.mqtt.topic.is_empty() {
            return Err(invalid("topic", "must not be empty"));
        }
        if self.mqtt.topic.contains(['+', '#']) {
            return Err(invalid("topic", "wildcards are not supported"));
        }
        if self.mqtt.connect_timeout.is_zero() || self.mqtt.subscribe_timeout.is_zero() {
            return Err(invalid("timeouts", "must be greater than zero"));
        }
        if self.targets.is_empty() {
            return Err(invalid("targets", "at least one broadcast target is required"));
        }
        if let Some(target) = self.targets.iter().find(|t| t.host.trim().is_empty()) {
            return Err(invalid("targets", &format!("empty host in {:?}", target)));
        }
        if self.targets.iter().any(|t| t.port == Some(0)) {
            return Err(invalid("targets", "port 0 is not a valid destination"));
        }
        Ok(())
    }
}

fn broker_from<L>(lookup: &L) -> Result<BrokerEndpoint, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(SERVER_ENV).ok_or(ConfigError::MissingServer)?;
    Ok(BrokerEndpoint::parse(&raw)?)
}

fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    Some(path)
}

async fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    info!("Loading configuration from {}", path.display());
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    FileConfig::from_toml(&content)
}
