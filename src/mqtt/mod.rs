//! # MQTT Bridge Module
//!
//! Owns the one bus session of the process and feeds wake requests into the
//! request handler.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker endpoint parsing and session settings
//! ├── message_manager.rs  - inbound message representation
//! ├── mqtt_handler.rs     - session state machine (connect, deliver, disconnect)
//! └── request_handler.rs  - payload decoding and wake dispatch
//! ```
//!
//! ## Lifecycle
//!
//! [`run_bridge`] connects and subscribes on the calling task, then moves
//! the session onto a spawned delivery task. The caller's only remaining
//! wait is the shutdown signal. Once it fires the delivery task is
//! cancelled, the session is handed back and disconnected with a bounded
//! wait.
//!
//! Startup failures (refused handshake, rejected subscription) are returned
//! as [`BridgeError`] and never retried here. Losing the connection after
//! startup is only logged.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod request_handler;

#[cfg(test)]
mod test_broker;

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::MqttConfig;
use mqtt_handler::{BridgeConnection, BridgeError, Disconnected};
use request_handler::RequestHandler;

/// Runs the bridge until `shutdown_signal` resolves
pub async fn run_bridge<F>(
    config: MqttConfig,
    handler: Arc<RequestHandler>,
    shutdown_signal: F,
) -> Result<(), BridgeError>
where
    F: Future<Output = ()>,
{
    let mut connected = BridgeConnection::<Disconnected>::create(config, handler)
        .begin_connect()
        .await_handshake()
        .await?;
    connected.subscribe().await?;

    let shutdown = CancellationToken::new();
    let delivery = tokio::spawn(connected.deliver_until(shutdown.clone()));

    shutdown_signal.await;
    info!("Termination requested, disconnecting");
    shutdown.cancel();

    let disconnecting = delivery
        .await
        .map_err(|e| BridgeError::Delivery(e.to_string()))?;
    let _disconnected = disconnecting.disconnect().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::test_broker::{
        test_config, BrokerScript, FakeBroker, CONNECT, DISCONNECT, PUBACK, SUBSCRIBE,
    };
    use super::*;
    use crate::wake::dispatcher::test_support::RecordingTransmitter;
    use crate::wake::{BroadcastTarget, MagicPacket, Transmitter, WakeDispatcher};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Mutex, OnceLock};
    use std::time::{Duration, Instant};
    use tokio::time::{sleep, timeout};

    const TOPIC: &str = "/wake_on_lan";

    fn handler_with(transmitter: Arc<RecordingTransmitter>) -> Arc<RequestHandler> {
        Arc::new(RequestHandler::new(
            WakeDispatcher::new(transmitter),
            vec![BroadcastTarget::default()],
        ))
    }

    #[tokio::test]
    async fn test_bridge_wakes_device_and_disconnects_on_shutdown() {
        // Arrange
        let broker = FakeBroker::start(BrokerScript::accepting(
            TOPIC,
            vec![
                br#"{"mac":"03:AA:FF:67:64:05","name":"desktop"}"#.to_vec(),
                br#"{"name":"desktop"}"#.to_vec(),
            ],
        ))
        .await;
        let transmitter = Arc::new(RecordingTransmitter::default());
        let handler = handler_with(transmitter.clone());

        let config = test_config(broker.endpoint());
        let disconnect_timeout = config.disconnect_timeout;

        let watched = handler.clone();
        let signalled = Arc::new(OnceLock::new());
        let signalled_at = signalled.clone();
        let shutdown_signal = async move {
            while watched.stats().dispatched.load(Ordering::Relaxed) < 1
                || watched.stats().dropped.load(Ordering::Relaxed) < 1
            {
                sleep(Duration::from_millis(10)).await;
            }
            signalled_at.get_or_init(Instant::now);
        };

        // Act
        let result = timeout(
            Duration::from_secs(10),
            run_bridge(config, handler.clone(), shutdown_signal),
        )
        .await
        .expect("bridge should shut down");
        let shutdown_took = signalled.get().expect("signal resolved").elapsed();

        // Assert
        assert!(result.is_ok(), "unexpected error: {:?}", result.err());
        assert!(
            shutdown_took <= disconnect_timeout + Duration::from_millis(200),
            "shutdown took {:?}",
            shutdown_took
        );
        {
            let sent = transmitter.sent.lock().unwrap();
            let ports: Vec<u16> = sent.iter().map(|(_, _, port)| *port).collect();
            assert_eq!(ports, vec![9, 7]);
            assert_eq!(&sent[0].0[6..12], &[0x03, 0xAA, 0xFF, 0x67, 0x64, 0x05]);
        }

        let seen = broker.session.await.unwrap();
        assert_eq!(seen.first(), Some(&CONNECT));
        assert!(seen.contains(&SUBSCRIBE));
        assert!(seen.contains(&PUBACK));
        assert_eq!(seen.last(), Some(&DISCONNECT));
    }

    #[tokio::test]
    async fn test_no_message_is_handled_once_shutdown_begins() {
        // Arrange: publishes are queued right behind the SUBACK
        let broker = FakeBroker::start(BrokerScript::accepting(
            TOPIC,
            vec![br#"{"mac":"03:AA:FF:67:64:05"}"#.to_vec(); 3],
        ))
        .await;
        let transmitter = Arc::new(RecordingTransmitter::default());
        let handler = handler_with(transmitter.clone());

        // Act: the signal is already pending when delivery starts
        let result = run_bridge(test_config(broker.endpoint()), handler.clone(), async {}).await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(transmitter.sent_count(), 0);
        assert_eq!(handler.stats().dispatched.load(Ordering::Relaxed), 0);
        let seen = broker.session.await.unwrap();
        assert_eq!(seen.last(), Some(&DISCONNECT));
    }

    #[tokio::test]
    async fn test_refused_handshake_is_fatal() {
        // Arrange
        let script = BrokerScript {
            connack_code: 0x05,
            ..BrokerScript::accepting(TOPIC, Vec::new())
        };
        let broker = FakeBroker::start(script).await;
        let transmitter = Arc::new(RecordingTransmitter::default());

        // Act
        let result = run_bridge(
            test_config(broker.endpoint()),
            handler_with(transmitter),
            std::future::pending(),
        )
        .await;

        // Assert
        assert!(matches!(result, Err(BridgeError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_fatal() {
        // Arrange: grab a free port and release it again
        let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);
        let endpoint = config::BrokerEndpoint {
            host: "127.0.0.1".to_string(),
            port,
        };
        let transmitter = Arc::new(RecordingTransmitter::default());

        // Act
        let result = timeout(
            Duration::from_secs(10),
            run_bridge(
                test_config(endpoint),
                handler_with(transmitter),
                std::future::pending(),
            ),
        )
        .await
        .expect("handshake must not hang");

        // Assert
        match result {
            Err(BridgeError::Connection { broker, .. }) => {
                assert_eq!(broker, format!("tcp://127.0.0.1:{port}"))
            }
            other => panic!("expected connection error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_rejected_subscription_is_fatal() {
        let script = BrokerScript {
            suback_code: 0x80,
            ..BrokerScript::accepting(TOPIC, Vec::new())
        };
        let broker = FakeBroker::start(script).await;
        let transmitter = Arc::new(RecordingTransmitter::default());

        let result = run_bridge(
            test_config(broker.endpoint()),
            handler_with(transmitter),
            std::future::pending(),
        )
        .await;

        match result {
            Err(BridgeError::Subscribe { topic, .. }) => assert_eq!(topic, TOPIC),
            other => panic!("expected subscribe error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_lost_connection_is_not_fatal() {
        // Arrange
        let script = BrokerScript {
            hang_up_after_subscribe: true,
            ..BrokerScript::accepting(TOPIC, Vec::new())
        };
        let broker = FakeBroker::start(script).await;
        let transmitter = Arc::new(RecordingTransmitter::default());
        let handler = handler_with(transmitter.clone());

        // Act: keep running through a few failed reconnects
        let result = timeout(
            Duration::from_secs(10),
            run_bridge(
                test_config(broker.endpoint()),
                handler,
                sleep(Duration::from_millis(300)),
            ),
        )
        .await
        .expect("bridge should shut down");

        // Assert
        assert!(result.is_ok());
        assert_eq!(transmitter.sent_count(), 0);
        let seen = broker.session.await.unwrap();
        assert!(!seen.contains(&DISCONNECT));
    }

    /// Blocks every send until released, like a stalled name lookup
    struct StalledTransmitter {
        started: AtomicBool,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Transmitter for StalledTransmitter {
        fn transmit(&self, _packet: &MagicPacket, _host: &str, _port: u16) -> std::io::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_transmission_does_not_delay_shutdown() {
        // Arrange
        let broker = FakeBroker::start(BrokerScript::accepting(
            TOPIC,
            vec![br#"{"mac":"03:AA:FF:67:64:05"}"#.to_vec()],
        ))
        .await;
        let (release, stalled) = mpsc::channel();
        let transmitter = Arc::new(StalledTransmitter {
            started: AtomicBool::new(false),
            release: Mutex::new(stalled),
        });
        let handler = Arc::new(RequestHandler::new(
            WakeDispatcher::new(transmitter.clone()),
            vec![BroadcastTarget::default()],
        ));
        let config = test_config(broker.endpoint());
        let disconnect_timeout = config.disconnect_timeout;

        let watched = transmitter.clone();
        let signalled = Arc::new(OnceLock::new());
        let signalled_at = signalled.clone();
        let shutdown_signal = async move {
            while !watched.started.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(10)).await;
            }
            signalled_at.get_or_init(Instant::now);
        };

        // Act
        let result = timeout(
            Duration::from_secs(5),
            run_bridge(config, handler, shutdown_signal),
        )
        .await
        .expect("shutdown must not wait for the stalled send");
        let shutdown_took = signalled.get().expect("signal resolved").elapsed();

        // Assert
        assert!(result.is_ok(), "unexpected error: {:?}", result.err());
        assert!(
            shutdown_took <= disconnect_timeout + Duration::from_millis(200),
            "shutdown took {:?}",
            shutdown_took
        );
        let seen = broker.session.await.unwrap();
        assert_eq!(seen.last(), Some(&DISCONNECT));

        release.send(()).unwrap();
    }
}
