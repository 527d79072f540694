use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use papaya_util::types::AccessToken;

/// Topic the platform listens on for device telemetry; the device is
/// identified by its connection credentials.
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("failed to serialize packet: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// A publish-only wire connection.
#[async_trait]
pub trait Transport {
    /// Send `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// First delay before reconnecting after a connection error
    pub min_reconnect_delay: Duration,
    /// Upper bound for the reconnection backoff
    pub max_reconnect_delay: Duration,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            min_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// MQTT connection authenticated with the device access token.
///
/// The connection is driven by a background task that keeps reconnecting
/// with capped exponential backoff, so a broker outage never requires a
/// process restart. Publishing while disconnected fails immediately, use
/// [`MqttTransport::wait_connected`] before handing the transport to a
/// worker.
pub struct MqttTransport {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    driver: JoinHandle<()>,
}

impl MqttTransport {
    /// Open the connection using `token` as the sole credential.
    ///
    /// Returns right away, the broker handshake happens in the background.
    pub fn connect(config: &MqttConfig, token: &AccessToken) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        // the access token is the username, the platform ignores the password
        options.set_credentials(token.as_str(), "");

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (connected_tx, connected) = watch::channel(false);
        let driver = tokio::spawn(drive_connection(
            eventloop,
            connected_tx,
            config.min_reconnect_delay,
            config.max_reconnect_delay,
        ));

        info!(host = %config.host, port = config.port, "connecting to broker");
        Self {
            client,
            connected,
            driver,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the broker connection state, `true` while the broker has
    /// acknowledged the current session
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Wait until the broker acknowledges the connection.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        matches!(
            tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await,
            Ok(Ok(_))
        )
    }

    /// Disconnect from the broker and stop the connection driver
    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect request failed: {e}");
        }
        // give the driver a chance to flush the disconnect packet
        if tokio::time::timeout(Duration::from_secs(2), self.driver)
            .await
            .is_err()
        {
            debug!("connection driver did not stop in time");
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }
}

#[instrument(name = "mqtt", skip_all)]
async fn drive_connection(
    mut eventloop: EventLoop,
    connected: watch::Sender<bool>,
    min_delay: Duration,
    max_delay: Duration,
) {
    let mut backoff = min_delay;
    loop {
        match eventloop.poll().await {
            // refused sessions surface as errors, a ConnAck here is a success
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to broker");
                connected.send_replace(true);
                backoff = min_delay;
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnecting from broker");
                connected.send_replace(false);
                continue;
            }
            Ok(_) => continue,
            Err(ConnectionError::RequestsDone) => {
                debug!("client dropped, stopping connection driver");
                connected.send_replace(false);
                break;
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                // bad credentials usually mean provisioning must be re-run
                warn!("broker refused connection: {code:?}");
                connected.send_replace(false);
            }
            Err(e) => {
                if connected.send_replace(false) {
                    warn!("connection lost: {e}");
                } else {
                    debug!("connection attempt failed: {e}");
                }
            }
        }

        // the next poll reconnects
        tokio::time::sleep(with_jitter(backoff)).await;
        backoff = std::cmp::min(backoff * 2, max_delay);
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::random_range(0..max_jitter))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::packet::{Scalar, TelemetryPacket, Values};
    use crate::queue::{OverflowPolicy, TelemetryQueue};
    use crate::worker::Publisher;

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;

    async fn listen() -> (TcpListener, MqttConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = MqttConfig::new("127.0.0.1", port, "gw-01");
        config.min_reconnect_delay = Duration::from_millis(10);
        config.max_reconnect_delay = Duration::from_millis(50);
        (listener, config)
    }

    /// Read one packet and return its MQTT control packet type
    async fn next_packet_type(socket: &mut TcpStream) -> u8 {
        let mut buf = [0u8; 512];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed");
        buf[0] >> 4
    }

    /// Accept a client and answer its CONNECT with the given return code
    async fn accept(listener: &TcpListener, code: u8) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        assert_eq!(next_packet_type(&mut socket).await, CONNECT);
        socket.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
        socket
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let delay = Duration::from_secs(8);
        for _ in 0..100 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered < delay + Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn it_refuses_to_publish_before_connecting() {
        // nothing listens on this port, the driver keeps retrying in the
        // background while we check the transport state
        let mut config = MqttConfig::new("127.0.0.1", 1, "gw-01");
        config.min_reconnect_delay = Duration::from_millis(10);
        let transport = MqttTransport::connect(&config, &AccessToken::from("token"));

        let res = transport.publish(TELEMETRY_TOPIC, b"{}".to_vec()).await;
        assert!(matches!(res, Err(PublishError::NotConnected)));
        assert!(!transport.is_connected());
        assert!(!transport.wait_connected(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn it_delivers_packets_queued_before_the_broker_answers() {
        let (listener, config) = listen().await;
        let queue = TelemetryQueue::new(Some(4), OverflowPolicy::default());
        let handshake = TelemetryPacket::new(
            1_700_000_000_000,
            Values::from([("handshake".to_owned(), Scalar::from(true))]),
        );
        assert!(queue.enqueue(handshake));

        let broker = tokio::spawn(async move {
            let mut socket = accept(&listener, 0).await;
            next_packet_type(&mut socket).await
        });

        let transport = MqttTransport::connect(&config, &AccessToken::from("A1B2C3D4E5"));
        assert!(transport.wait_connected(Duration::from_secs(5)).await);

        queue.close();
        let transport = Publisher::new(queue.clone(), transport)
            .run(TELEMETRY_TOPIC)
            .await;

        let metrics = queue.metrics();
        assert_eq!(metrics.publish_count, 1);
        assert_eq!(metrics.failed_count, 0);
        assert_eq!(broker.await.unwrap(), PUBLISH);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn it_reconnects_after_the_broker_drops_the_connection() {
        let (listener, config) = listen().await;
        let transport = MqttTransport::connect(&config, &AccessToken::from("A1B2C3D4E5"));
        let mut connection = transport.connection();

        let first = accept(&listener, 0).await;
        assert!(transport.wait_connected(Duration::from_secs(5)).await);

        drop(first);
        let lost = tokio::time::timeout(Duration::from_secs(5), connection.wait_for(|c| !*c))
            .await
            .unwrap()
            .is_ok();
        assert!(lost);
        assert!(!transport.is_connected());

        // the driver dials again on its own
        let mut second = accept(&listener, 0).await;
        assert!(transport.wait_connected(Duration::from_secs(5)).await);

        transport
            .publish(TELEMETRY_TOPIC, br#"{"ts":1,"values":{"seq":1}}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(next_packet_type(&mut second).await, PUBLISH);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn it_stays_disconnected_when_the_broker_refuses_the_token() {
        let (listener, config) = listen().await;
        let transport = MqttTransport::connect(&config, &AccessToken::from("revoked"));

        // 0x05: not authorized
        let _socket = accept(&listener, 0x05).await;

        assert!(!transport.wait_connected(Duration::from_millis(200)).await);
        let res = transport.publish(TELEMETRY_TOPIC, b"{}".to_vec()).await;
        assert!(matches!(res, Err(PublishError::NotConnected)));
    }
}
