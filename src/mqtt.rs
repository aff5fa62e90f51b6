//! MQTT client implementation

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, Transport,
};
use tokio::task::JoinHandle;

use crate::{config::MqttConfig, config::MqttTransport, errors::FencewatchError, models::GpsFix};

/// How long pending acknowledgements get to reach the broker on disconnect
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One received message, to be acknowledged once handled
#[derive(Debug)]
pub struct Delivery {
    /// Decoded payload, or why it could not be decoded
    fix: Result<GpsFix, FencewatchError>,
    receipt: Receipt,
}

impl Delivery {
    pub fn into_parts(self) -> (Result<GpsFix, FencewatchError>, Receipt) {
        (self.fix, self.receipt)
    }
}

/// What the broker needs to acknowledge a message
#[derive(Debug)]
pub struct Receipt(Publish);

impl Receipt {
    pub fn topic(&self) -> &str {
        &self.0.topic
    }
}

/// MQTT client builder for receiving GPS fixes
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
}

pub struct MqttClient {
    client: AsyncClient,
    rx: mpsc::Receiver<Delivery>,
    handle: JoinHandle<Result<(), FencewatchError>>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    ///
    /// Messages are acknowledged manually and the session is persistent, so
    /// anything not acknowledged is redelivered by the broker.
    pub fn new(config: &MqttConfig) -> Result<Self, FencewatchError> {
        config.validate()?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        match config.transport {
            MqttTransport::Tcp => {}
            MqttTransport::Tls => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
            MqttTransport::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
        }
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(false);
        mqtt_options.set_manual_acks(true);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        // Create a channel for message passing
        let (tx, rx) = mpsc::channel(100);

        Ok(Self {
            client,
            event_loop,
            tx,
            rx,
        })
    }

    /// Connect to MQTT broker and subscribe to topics
    ///
    /// Note: Initial subscription needs not be done here, as it is done
    /// in the event loop.
    pub async fn connect(self, topics: &[String]) -> Result<MqttClient, FencewatchError> {
        let handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(), // Clone client for event loop
            topics.to_vec(),
        ));

        Ok(MqttClient {
            client: self.client,
            rx: self.rx,
            handle,
        })
    }

    async fn subscribe(client: AsyncClient, topics: &[String]) -> Result<(), FencewatchError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects automatically when the connection is lost, but
    /// topic subscriptions need to be re-established, so subscribing is done
    /// on every ConnAck.
    ///
    /// NOTE: If topic subscription fails, the loop will break and return an error.
    async fn process_events(
        tx: mpsc::Sender<Delivery>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
    ) -> Result<(), FencewatchError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(client.clone(), &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let fix = Self::parse_message(&publish.payload);
                    if let Err(e) = &fix {
                        warn!(topic = %publish.topic, "Failed to parse message: {}", e);
                    }
                    let delivery = Delivery {
                        fix,
                        receipt: Receipt(publish),
                    };
                    if tx.send(delivery).await.is_err() {
                        debug!("Receiver dropped, stopping MQTT event loop");
                        break Ok(());
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break Ok(());
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ => continue,
            }
        }
    }

    /// Decode a GPS fix payload
    fn parse_message(payload: &[u8]) -> Result<GpsFix, FencewatchError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl MqttClient {
    /// Receive next message
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Cheap handle for acknowledging from worker tasks
    pub fn acker(&self) -> Acker {
        Acker(self.client.clone())
    }

    /// Disconnect from the broker and stop the event loop
    ///
    /// The DISCONNECT is queued behind any pending acknowledgements, so the
    /// event loop is given time to flush them before it is stopped.
    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }
        stop_event_loop(self.handle, DISCONNECT_TIMEOUT).await;
    }
}

/// Wait up to `limit` for the event loop to finish, then abort it.
///
/// Returns whether it finished on its own.
async fn stop_event_loop(
    mut handle: JoinHandle<Result<(), FencewatchError>>,
    limit: Duration,
) -> bool {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            warn!("MQTT event loop ended with error: {}", e);
            true
        }
        Ok(Err(e)) => {
            warn!("MQTT event loop task failed: {}", e);
            true
        }
        Err(_) => {
            warn!("MQTT event loop did not stop in {:?}, aborting", limit);
            handle.abort();
            false
        }
    }
}

#[derive(Clone)]
pub struct Acker(AsyncClient);

impl Acker {
    /// Tell the broker the message is done with
    pub async fn ack(&self, receipt: &Receipt) -> Result<(), FencewatchError> {
        self.0.ack(&receipt.0).await?;
        Ok(())
    }
}
