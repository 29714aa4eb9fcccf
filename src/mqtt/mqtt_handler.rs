//! Bus session state machine
//!
//! The single MQTT session of the process, modelled with statum so that
//! only a `Connected` session can deliver messages and only a
//! `Disconnecting` one can be torn down:
//!
//! ```text
//! Disconnected ─begin_connect→ Connecting ─await_handshake→ Connected
//!      ↑                                                       │
//!      └──────────── disconnect ── Disconnecting ←─deliver_until┘
//! ```
//!
//! Handshake and subscription failures are returned to the caller and not
//! retried; restarting the process is left to the process supervisor.

use std::sync::Arc;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode,
};
use statum::{machine, state};
use tokio::{
    select, task,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::InboundMessage;
use super::request_handler::RequestHandler;

/// Capacity of the request channel between client and event loop
const REQUEST_CAPACITY: usize = 10;

/// Fatal errors of the bus session
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The broker could not be reached or refused the handshake
    #[error("Connection to {broker} failed: {reason}")]
    Connection { broker: String, reason: String },

    /// The broker rejected the subscription or never acknowledged it
    #[error("Subscription to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// The delivery task ended abnormally
    #[error("Delivery task failed: {0}")]
    Delivery(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[machine]
pub struct BridgeConnection<S: BridgeState> {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    handler: Arc<RequestHandler>,
}

impl BridgeConnection<Disconnected> {
    /// Prepares the session without touching the network
    pub fn create(config: MqttConfig, handler: Arc<RequestHandler>) -> Self {
        let mut mqtt_options = MqttOptions::new(
            config.client_id.clone(),
            config.broker.host.clone(),
            config.broker.port,
        );
        mqtt_options
            .set_keep_alive(config.keep_alive)
            .set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        debug!(
            "Created MQTT client {} for {}",
            config.client_id, config.broker
        );

        Self::new(config, client, eventloop, handler)
    }

    pub fn begin_connect(self) -> BridgeConnection<Connecting> {
        info!(
            "Connecting to {} as {}",
            self.config.broker, self.config.client_id
        );
        self.transition()
    }
}

impl BridgeConnection<Connecting> {
    /// Drives the transport until the broker accepts the session
    pub async fn await_handshake(mut self) -> Result<BridgeConnection<Connected>, BridgeError> {
        let bound = self.config.connect_timeout;
        let broker = self.config.broker.to_string();

        let reason = match timeout(bound, wait_for_connack(&mut self.eventloop)).await {
            Ok(Ok(())) => {
                info!("Connected to {}", broker);
                return Ok(self.transition());
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("no CONNACK within {:?}", bound),
        };

        error!("Connection to {} failed: {}", broker, reason);
        Err(BridgeError::Connection { broker, reason })
    }
}

impl BridgeConnection<Connected> {
    /// Subscribes to the wake topic at QoS 1 and waits for the SUBACK
    pub async fn subscribe(&mut self) -> Result<(), BridgeError> {
        let topic = self.config.topic.clone();
        let subscribe_error = |reason: String| {
            error!("Subscription to {} failed: {}", topic, reason);
            BridgeError::Subscribe {
                topic: topic.clone(),
                reason,
            }
        };

        self.client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        let bound = self.config.subscribe_timeout;
        let waiting = wait_for_suback(&mut self.eventloop, &self.handler, &topic);
        match timeout(bound, waiting).await {
            Ok(Ok(())) => {
                info!("Subscribed to topic: {}", topic);
                Ok(())
            }
            Ok(Err(reason)) => Err(subscribe_error(reason)),
            Err(_) => Err(subscribe_error(format!("no SUBACK within {:?}", bound))),
        }
    }

    /// Hands every publish on the wake topic to the request handler until
    /// `shutdown` is cancelled
    ///
    /// Transport errors are logged and the loop keeps polling, which lets
    /// the client reconnect on its own. Nothing is delivered once
    /// cancellation has been observed, and a request still in flight at
    /// that point is left to finish in the background.
    pub async fn deliver_until(
        mut self,
        shutdown: CancellationToken,
    ) -> BridgeConnection<Disconnecting> {
        info!("Waiting for wake requests on {}", self.config.topic);

        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        select! {
                            biased;
                            _ = shutdown.cancelled() => {
                                warn!("Shutdown while a wake request was in flight");
                                break;
                            }
                            _ = deliver(&self.handler, &self.config.topic, publish) => {}
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Reconnected to {}", self.config.broker);
                        if !ack.session_present {
                            resubscribe(&self.client, &self.config.topic);
                        }
                    }
                    Ok(event) => debug!("MQTT event: {:?}", event),
                    Err(e) => {
                        warn!("Connection Lost: {}", e);
                        select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = sleep(self.config.reconnect_pause) => {}
                        }
                    }
                }
            }
        }

        info!("Shutdown requested, no further wake requests will be handled");
        self.transition()
    }
}

impl BridgeConnection<Disconnecting> {
    /// Sends DISCONNECT and waits at most `disconnect_timeout` for it to
    /// leave the socket
    pub async fn disconnect(mut self) -> BridgeConnection<Disconnected> {
        let bound = self.config.disconnect_timeout;

        match self.client.try_disconnect() {
            Ok(()) => match timeout(bound, flush_disconnect(&mut self.eventloop)).await {
                Ok(()) => info!("Disconnected from {}", self.config.broker),
                Err(_) => warn!("Disconnect did not complete within {:?}", bound),
            },
            Err(e) => warn!("Unable to request disconnect: {}", e),
        }

        self.transition()
    }
}

/// Runs the handler on the blocking pool
///
/// Name resolution and socket sends block, so they must not stall the
/// event loop or the shutdown path.
async fn deliver(handler: &Arc<RequestHandler>, topic: &str, publish: Publish) {
    let message = InboundMessage::from_publish(publish);
    if message.topic != topic {
        debug!("Ignoring message on unexpected topic {}", message.topic);
        return;
    }
    info!("Received message: {}", message);

    let handler = handler.clone();
    if let Err(e) = task::spawn_blocking(move || handler.handle(&message.payload)).await {
        error!("Wake request handling failed: {}", e);
    }
}

/// A fresh session after a transport reconnect has lost the subscription
fn resubscribe(client: &AsyncClient, topic: &str) {
    match client.try_subscribe(topic, QoS::AtLeastOnce) {
        Ok(()) => info!("Re-subscribing to topic: {}", topic),
        Err(e) => warn!("Unable to re-subscribe to {}: {}", topic, e),
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(format!("broker refused connection: {:?}", code)),
                };
            }
            Ok(event) => debug!("MQTT event before CONNACK: {:?}", event),
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn wait_for_suback(
    eventloop: &mut EventLoop,
    handler: &Arc<RequestHandler>,
    topic: &str,
) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = !ack.return_codes.is_empty()
                    && ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                return if granted {
                    Ok(())
                } else {
                    Err(format!("broker rejected subscription: {:?}", ack.return_codes))
                };
            }
            // Already connected, so publishes racing the SUBACK are handled
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                deliver(handler, topic, publish).await
            }
            Ok(event) => debug!("MQTT event before SUBACK: {:?}", event),
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn flush_disconnect(eventloop: &mut EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Discarding message on {} during shutdown", publish.topic)
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Transport closed during disconnect: {}", e);
                return;
            }
        }
    }
}
