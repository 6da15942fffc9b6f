use crate::config::Config;
use crate::publisher::{IndicatorPayload, IndicatorSink, PublishError};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use uuid::Uuid;

/// Capacity of the request channel between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub reconnect_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker_url: config.mqtt_broker_url.clone(),
            mqtt_host: config.mqtt_endpoint.host.clone(),
            mqtt_port: config.mqtt_endpoint.port,
            mqtt_username: config.mqtt_username.clone(),
            mqtt_password: config.mqtt_password.clone(),
            client_id: generate_client_id(),
            topic: config.mqtt_topic.clone(),
            qos: config.mqtt_qos,
            reconnect_period_ms: config.mqtt_reconnect_period_ms,
            connect_timeout_ms: config.mqtt_connect_timeout_ms,
            keep_alive_secs: config.mqtt_keep_alive_secs,
        }
    }
}

/// `CMAS_` followed by 12 uppercase hex digits.
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("CMAS_{}", &id[..12])
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("MQTT event loop error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Owns the single broker connection and its connected flag.
pub struct MqttService {
    connected: AtomicBool,
    shutting_down: AtomicBool,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    pub(crate) config: MqttConfig,
}

impl MqttService {
    pub fn new(config: MqttConfig) -> Arc<Self> {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.mqtt_host.clone(), config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        mqtt_options.set_clean_session(true);

        if !config.mqtt_username.is_empty() && !config.mqtt_password.is_empty() {
            mqtt_options.set_credentials(&config.mqtt_username, &config.mqtt_password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        // Whole seconds, rounded up.
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout_ms.div_ceil(1000).max(1));
        eventloop.set_network_options(network_options);

        Arc::new(Self {
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            client,
            eventloop: Mutex::new(Some(eventloop)),
            config,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drives the event loop until [`MqttService::disconnect`] is called,
    /// reconnecting at a fixed interval whenever the connection drops.
    pub async fn start(self: Arc<Self>) {
        let Some(eventloop) = self.eventloop.lock().await.take() else {
            warn!("MQTT service already started.");
            return;
        };
        let eventloop = Arc::new(Mutex::new(eventloop));

        info!(
            "Starting MQTT service for {}:{} as '{}'...",
            self.config.mqtt_host, self.config.mqtt_port, self.config.client_id
        );

        let strategy = FixedInterval::from_millis(self.config.reconnect_period_ms);
        let result = Retry::start(strategy, || {
            let service = self.clone();
            let eventloop = eventloop.clone();
            async move {
                let mut eventloop = eventloop.lock().await;
                service.run_session(&mut eventloop).await
            }
        })
        .await;

        self.set_connected(false);
        match result {
            Ok(()) => info!("MQTT connection closed"),
            Err(e) => error!("MQTT service stopped: {}", e),
        }
    }

    /// One connection attempt and, if it succeeds, the life of that connection.
    async fn run_session(&self, eventloop: &mut EventLoop) -> Result<(), SessionError> {
        if self.is_shutting_down() {
            return Ok(());
        }
        debug!(
            "Connecting to MQTT broker at {}:{}...",
            self.config.mqtt_host, self.config.mqtt_port
        );

        loop {
            match eventloop.poll().await {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    self.set_connected(false);
                    if self.is_shutting_down() {
                        return Ok(());
                    }
                    error!("MQTT error: {}", e);
                    warn!(
                        "MQTT client offline. Reconnecting in {} ms...",
                        self.config.reconnect_period_ms
                    );
                    return Err(e.into());
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.set_connected(true);
                    info!("MQTT connected on {}", self.config.broker_url);
                } else {
                    warn!("MQTT broker refused connection: {:?}", ack.code);
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                debug!("Broker acknowledged publish {}", ack.pkid);
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                debug!("Broker completed publish {}", comp.pkid);
            }
            Event::Incoming(Packet::Disconnect) => {
                self.set_connected(false);
                warn!("MQTT broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                self.set_connected(false);
                info!("MQTT DISCONNECT sent");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                debug!("Outgoing publish {}", pkid);
            }
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }

    /// Sends DISCONNECT and stops reconnecting. The supervisor returns once
    /// the event loop has wound down.
    pub async fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.set_connected(false);
        info!("Closing MQTT connection...");
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to queue MQTT DISCONNECT: {}", e);
        }
    }
}

#[rocket::async_trait]
impl IndicatorSink for MqttService {
    fn is_connected(&self) -> bool {
        MqttService::is_connected(self)
    }

    async fn publish(&self, payload: &IndicatorPayload) -> Result<(), PublishError> {
        let message = payload.to_json()?;
        let topic = &self.config.topic;

        match self
            .client
            .publish(topic.as_str(), self.config.qos, false, message.clone())
            .await
        {
            Ok(()) => {
                info!("Published {}: {}", topic, message);
                Ok(())
            }
            Err(e) => {
                error!("MQTT publish failed: {}", e);
                Err(PublishError::Client(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::LineStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const DISCONNECT: [u8; 2] = [0xE0, 0x00];

    fn test_config(port: u16) -> MqttConfig {
        MqttConfig {
            broker_url: format!("mqtt://127.0.0.1:{}", port),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: port,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            client_id: generate_client_id(),
            topic: "cmas/test".to_string(),
            qos: QoS::AtMostOnce,
            reconnect_period_ms: 100,
            connect_timeout_ms: 1000,
            keep_alive_secs: 60,
        }
    }

    #[test]
    fn client_id_shape() {
        let id = generate_client_id();
        assert_eq!(id.len(), 17);
        assert!(id.starts_with("CMAS_"));
        assert!(id[5..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(id, generate_client_id());
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let service = MqttService::new(test_config(1));
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn publish_is_accepted_while_the_loop_is_idle() {
        let service = MqttService::new(test_config(1));
        let payload = IndicatorPayload::new("A1", LineStatus::Active);
        assert!(service.publish(&payload).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_broker_keeps_retrying_until_disconnect() {
        // Nothing listens on port 1, so every attempt is refused.
        let service = MqttService::new(test_config(1));
        let handle = tokio::spawn(service.clone().start());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!service.is_connected());
        assert!(!handle.is_finished());

        service.disconnect().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should stop after disconnect")
            .unwrap();
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn second_start_returns_immediately() {
        let service = MqttService::new(test_config(1));
        let first = tokio::spawn(service.clone().start());
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), service.clone().start())
            .await
            .expect("a second start must not drive the loop");

        service.disconnect().await;
        tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
    }

    /// Accepts one client on `listener`, reads its CONNECT and answers with CONNACK.
    async fn accept_and_ack(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client should connect")
            .unwrap();
        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0] >> 4, 1, "first packet must be CONNECT");
        socket.write_all(&CONNACK_ACCEPTED).await.unwrap();
        socket
    }

    async fn wait_for_state(service: &MqttService, connected: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.is_connected() != connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection state never became {}", connected));
    }

    #[tokio::test]
    async fn connection_state_follows_broker_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let service = MqttService::new(test_config(port));
        let handle = tokio::spawn(service.clone().start());

        let socket = accept_and_ack(&listener).await;
        wait_for_state(&service, true).await;

        // Broker goes away: the flag drops and the client comes back on its own.
        drop(socket);
        wait_for_state(&service, false).await;
        let mut socket = accept_and_ack(&listener).await;
        wait_for_state(&service, true).await;
        assert!(!handle.is_finished());

        service.disconnect().await;
        assert!(!service.is_connected());

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut buf = [0u8; 64];
            while !received.windows(2).any(|w| w == DISCONNECT) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .expect("DISCONNECT should reach the broker");
        assert!(received.windows(2).any(|w| w == DISCONNECT));
        drop(socket);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should stop after disconnect")
            .unwrap();
        assert!(!service.is_connected());
    }
}
