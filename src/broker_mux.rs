use crate::config::BrokerConfig;
use crate::mqtt_service::MqttBroker;
use async_trait::async_trait;
use log::{debug, info};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Broker name reported for addresses that carry no `broker:` prefix.
pub const UNKNOWN_BROKER: &str = "UNKNOWN";

/// A delivered MQTT message, independent of the client that received it.
pub trait Message: Send + Sync {
    fn topic(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn qos(&self) -> QoS;
    fn duplicate(&self) -> bool;
    fn retained(&self) -> bool;
    fn message_id(&self) -> u16;
    fn ack(&self);
}

/// Subscription callback. Runs on the broker's event loop task, so it must
/// not block.
pub type MessageHandler = Arc<dyn Fn(&dyn Message) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0} is not a valid broker")]
    UnknownBroker(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("event loop for broker {0} is gone")]
    Closed(String),
}

/// One connected broker, addressed with broker-native topics.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BrokerError>;
}

/// Routes `broker:topic` addresses to the matching broker connection.
pub struct BrokerMux {
    brokers: HashMap<String, Arc<dyn BrokerClient>>,
}

impl BrokerMux {
    /// Connects every configured broker in turn. This does not return until
    /// all of them have accepted a connection: a misconfigured broker hangs
    /// startup here, which is preferred over running half connected.
    pub async fn connect(configs: &[BrokerConfig]) -> Arc<Self> {
        let mut clients: Vec<(String, Arc<dyn BrokerClient>)> = Vec::with_capacity(configs.len());

        for config in configs {
            let broker: Arc<dyn BrokerClient> = Arc::new(MqttBroker::connect(config).await);
            info!("bmux: new broker: {}={}:{}", config.name, config.host, config.port);
            clients.push((config.name.clone(), broker));
        }

        Self::with_clients(clients)
    }

    pub fn with_clients<I>(clients: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (String, Arc<dyn BrokerClient>)>,
    {
        Arc::new(Self {
            brokers: clients.into_iter().collect(),
        })
    }

    fn resolve<'a>(
        &self,
        address: &'a str,
    ) -> Result<(&'a str, &'a str, Arc<dyn BrokerClient>), BrokerError> {
        let (broker, topic) = split_address(address);
        match self.brokers.get(broker) {
            Some(client) => Ok((broker, topic, client.clone())),
            None => Err(BrokerError::UnknownBroker(broker.to_string())),
        }
    }

    pub async fn publish(
        &self,
        address: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let (_, topic, client) = self.resolve(address)?;
        client.publish(topic, qos, retain, payload.into()).await
    }

    /// Subscribes to `broker:filter`. Messages handed to `callback` report
    /// their topic as `broker:topic`.
    pub async fn subscribe<F>(&self, address: &str, qos: QoS, callback: F) -> Result<(), BrokerError>
    where
        F: Fn(&dyn Message) + Send + Sync + 'static,
    {
        let (broker, filter, client) = self.resolve(address)?;
        debug!("bmux: subscribe: {}:{}", broker, filter);

        let broker = broker.to_string();
        let handler: MessageHandler = Arc::new(move |msg: &dyn Message| {
            let wrapped = NamespacedMessage::new(&broker, msg);
            callback(&wrapped);
        });

        client.subscribe(filter, qos, handler).await
    }
}

/// Splits on the first colon. Addresses without one map to `UNKNOWN`.
pub fn split_address(address: &str) -> (&str, &str) {
    address.split_once(':').unwrap_or((UNKNOWN_BROKER, ""))
}

/// Reports `broker:topic` as its topic and forwards everything else.
pub struct NamespacedMessage<'a> {
    inner: &'a dyn Message,
    topic: String,
}

impl<'a> NamespacedMessage<'a> {
    pub fn new(broker: &str, inner: &'a dyn Message) -> Self {
        Self {
            topic: format!("{}:{}", broker, inner.topic()),
            inner,
        }
    }
}

impl Message for NamespacedMessage<'_> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn payload(&self) -> &[u8] {
        self.inner.payload()
    }

    fn qos(&self) -> QoS {
        self.inner.qos()
    }

    fn duplicate(&self) -> bool {
        self.inner.duplicate()
    }

    fn retained(&self) -> bool {
        self.inner.retained()
    }

    fn message_id(&self) -> u16 {
        self.inner.message_id()
    }

    fn ack(&self) {
        self.inner.ack()
    }
}
