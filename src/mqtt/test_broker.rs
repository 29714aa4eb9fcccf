//! Minimal in-process MQTT 3.1.1 broker for lifecycle tests
//!
//! Serves exactly one client connection and records the control packet
//! types it receives.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::config::{BrokerEndpoint, MqttConfig};

pub const CONNECT: u8 = 0x10;
pub const PUBACK: u8 = 0x40;
pub const SUBSCRIBE: u8 = 0x80;
pub const PINGREQ: u8 = 0xC0;
pub const DISCONNECT: u8 = 0xE0;

#[derive(Clone, Default)]
pub struct BrokerScript {
    /// CONNACK return code, 0 accepts the session
    pub connack_code: u8,
    /// SUBACK return code, 0x80 rejects the subscription
    pub suback_code: u8,
    /// Publishes sent on the wake topic right after the SUBACK
    pub publishes: Vec<Vec<u8>>,
    pub topic: String,
    /// Drop the connection once the publishes are out
    pub hang_up_after_subscribe: bool,
}

impl BrokerScript {
    pub fn accepting(topic: &str, publishes: Vec<Vec<u8>>) -> Self {
        Self {
            connack_code: 0x00,
            suback_code: 0x01,
            publishes,
            topic: topic.to_string(),
            hang_up_after_subscribe: false,
        }
    }
}

pub struct FakeBroker {
    pub addr: SocketAddr,
    /// Resolves to the packet types the client sent, in order
    pub session: JoinHandle<Vec<u8>>,
}

impl FakeBroker {
    pub async fn start(script: BrokerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("broker bind");
        let addr = listener.local_addr().unwrap();
        let session = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            serve(stream, script).await
        });
        Self { addr, session }
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }
}

/// Short bounds so failing tests finish quickly
pub fn test_config(broker: BrokerEndpoint) -> MqttConfig {
    let mut config = MqttConfig::new(broker);
    config.connect_timeout = Duration::from_secs(2);
    config.subscribe_timeout = Duration::from_secs(2);
    config.disconnect_timeout = Duration::from_secs(1);
    config.reconnect_pause = Duration::from_millis(50);
    config
}

async fn serve(mut stream: TcpStream, script: BrokerScript) -> Vec<u8> {
    let mut seen = Vec::new();

    while let Some((header, body)) = read_packet(&mut stream).await {
        let kind = header & 0xF0;
        seen.push(kind);

        match kind {
            CONNECT => {
                let connack = [0x20, 0x02, 0x00, script.connack_code];
                if stream.write_all(&connack).await.is_err() || script.connack_code != 0 {
                    break;
                }
            }
            SUBSCRIBE => {
                let suback = [0x90, 0x03, body[0], body[1], script.suback_code];
                if stream.write_all(&suback).await.is_err() {
                    break;
                }
                for (index, payload) in script.publishes.iter().enumerate() {
                    let frame = publish_frame(&script.topic, index as u16 + 1, payload);
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                if script.hang_up_after_subscribe {
                    break;
                }
            }
            PINGREQ => {
                let _ = stream.write_all(&[0xD0, 0x00]).await;
            }
            DISCONNECT => break,
            _ => {}
        }
    }

    seen
}

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        remaining |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn publish_frame(topic: &str, packet_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut variable = Vec::new();
    variable.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    variable.extend_from_slice(topic.as_bytes());
    variable.extend_from_slice(&packet_id.to_be_bytes());
    variable.extend_from_slice(payload);

    // QoS 1 publish
    let mut frame = vec![0x32];
    let mut remaining = variable.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if remaining == 0 {
            break;
        }
    }
    frame.extend_from_slice(&variable);
    frame
}
