use crate::broker_mux::{BrokerClient, BrokerError, Message, MessageHandler};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

/// Wait between failed connection attempts at startup.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Pause before the event loop polls again after losing the connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

struct Subscription {
    id: u64,
    filter: String,
    handler: MessageHandler,
}

/// Changes to the subscription table, applied by the event loop task.
enum Registration {
    Add(Subscription),
    Remove(u64),
}

/// A single broker connection backed by `rumqttc`.
pub struct MqttBroker {
    name: String,
    client: AsyncClient,
    registrations: mpsc::UnboundedSender<Registration>,
    next_id: AtomicU64,
}

impl MqttBroker {
    /// Retries every minute, forever, until the broker answers with a ConnAck.
    pub async fn connect(config: &BrokerConfig) -> Self {
        let client_id = if config.client.is_empty() {
            format!("matrixhub_{}", Uuid::new_v4())
        } else {
            config.client.clone()
        };

        let (client, eventloop) = loop {
            debug!("Configuring MQTT broker at {}:{}...", config.host, config.port);

            match try_connect(config, &client_id).await {
                Ok(connected) => break connected,
                Err(e) => {
                    info!(
                        "bmux: error connecting to broker {} at start: {}. Retrying in {:?}...",
                        config.name, e, CONNECT_RETRY_INTERVAL
                    );
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        };

        info!("MQTT: connected: {}", client_id);

        let (registrations, pending) = mpsc::unbounded_channel();
        let ack_client = config.manual_acks.then(|| client.clone());
        tokio::spawn(run_event_loop(config.name.clone(), eventloop, ack_client, pending));

        Self {
            name: config.name.clone(),
            client,
            registrations,
            next_id: AtomicU64::new(0),
        }
    }
}

fn mqtt_options(config: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(10));
    mqtt_options.set_clean_session(false);
    mqtt_options.set_manual_acks(config.manual_acks);

    if !config.username.is_empty() && !config.password.is_empty() {
        mqtt_options.set_credentials(&config.username, &config.password);
    }

    if config.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    mqtt_options
}

async fn try_connect(
    config: &BrokerConfig,
    client_id: &str,
) -> Result<(AsyncClient, EventLoop), ConnectionError> {
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(config, client_id), REQUEST_CHANNEL_CAPACITY);

    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok((client, eventloop));
        }
    }
}

/// Drives the connection for the rest of the process lifetime. The
/// subscription table lives only here; new entries arrive over `pending`.
async fn run_event_loop(
    name: String,
    mut eventloop: EventLoop,
    ack_client: Option<AsyncClient>,
    mut pending: mpsc::UnboundedReceiver<Registration>,
) {
    let mut subscriptions: Vec<Subscription> = Vec::new();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                apply_registrations(&mut subscriptions, &mut pending);

                let message = MqttMessage {
                    publish,
                    ack_client: ack_client.clone(),
                };

                for subscription in subscriptions
                    .iter()
                    .filter(|s| topic_matches(&s.filter, &message.publish.topic))
                {
                    (subscription.handler)(&message);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT: reconnected: {}", name);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT: disconnected by broker: {}", name);
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT: disconnected: {}: {:?}", name, e);
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn apply_registrations(
    subscriptions: &mut Vec<Subscription>,
    pending: &mut mpsc::UnboundedReceiver<Registration>,
) {
    while let Ok(registration) = pending.try_recv() {
        match registration {
            Registration::Add(subscription) => subscriptions.push(subscription),
            Registration::Remove(id) => subscriptions.retain(|s| s.id != id),
        }
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        // Registered before the SUBSCRIBE goes out so the first matching
        // publish already finds its handler.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .send(Registration::Add(Subscription {
                id,
                filter: filter.to_string(),
                handler,
            }))
            .map_err(|_| BrokerError::Closed(self.name.clone()))?;

        if let Err(e) = self.client.subscribe(filter, qos).await {
            // Only handlers with a live SUBSCRIBE stay in the table.
            let _ = self.registrations.send(Registration::Remove(id));
            return Err(e.into());
        }
        Ok(())
    }
}

struct MqttMessage {
    publish: Publish,
    ack_client: Option<AsyncClient>,
}

impl Message for MqttMessage {
    fn topic(&self) -> &str {
        &self.publish.topic
    }

    fn payload(&self) -> &[u8] {
        &self.publish.payload
    }

    fn qos(&self) -> QoS {
        self.publish.qos
    }

    fn duplicate(&self) -> bool {
        self.publish.dup
    }

    fn retained(&self) -> bool {
        self.publish.retain
    }

    fn message_id(&self) -> u16 {
        self.publish.pkid
    }

    /// Only does something when the broker was configured for manual acks;
    /// otherwise the client has already acknowledged the packet.
    fn ack(&self) {
        if let Some(client) = &self.ack_client {
            if let Err(e) = client.try_ack(&self.publish) {
                warn!("MQTT: ack failed for '{}': {}", self.publish.topic, e);
            }
        }
    }
}

/// MQTT topic filter matching: `+` is one level, `#` the rest of the topic.
/// Wildcards in the first level never match `$SYS`-style topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
