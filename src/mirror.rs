use crate::broker_mux::BrokerMux;
use crate::config::MirrorConfig;
use crate::service_utils::publish_detached;
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Republishes everything seen on `sub` to `pub`. Wildcards only make sense
/// on the subscribe side.
pub async fn init_mirror(mux: Arc<BrokerMux>, configs: &[MirrorConfig]) {
    for mirror in configs {
        info!("mirror: {} -> {}", mirror.sub, mirror.publish);

        let target = mirror.publish.clone();
        let publisher = mux.clone();
        let result = mux
            .subscribe(&mirror.sub, QoS::AtMostOnce, move |msg| {
                debug!("mirror: processing {}", msg.topic());
                publish_detached(
                    publisher.clone(),
                    target.clone(),
                    QoS::AtMostOnce,
                    false,
                    msg.payload(),
                );
            })
            .await;

        if let Err(e) = result {
            error!("mirror: {}: {}", mirror.sub, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_mux::testing::{recording_mux, TestMessage};

    #[tokio::test]
    async fn copies_payload_to_target() {
        let (mux, broker) = recording_mux("home");
        let configs = vec![MirrorConfig {
            sub: "home:weather/#".to_string(),
            publish: "home:matrix/weather".to_string(),
        }];

        init_mirror(mux, &configs).await;
        assert_eq!(broker.filters(), vec!["weather/#".to_string()]);

        broker.deliver(&TestMessage::new("weather/today", b"sunny"));
        broker.deliver(&TestMessage::new("sensors/porch", b"ignored"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "matrix/weather");
        assert_eq!(published[0].payload, b"sunny".to_vec());
    }

    #[tokio::test]
    async fn bad_source_broker_is_skipped() {
        let (mux, broker) = recording_mux("home");
        let configs = vec![
            MirrorConfig {
                sub: "cloud:weather".to_string(),
                publish: "home:matrix".to_string(),
            },
            MirrorConfig {
                sub: "home:in".to_string(),
                publish: "home:out".to_string(),
            },
        ];

        init_mirror(mux, &configs).await;
        assert_eq!(broker.filters(), vec!["in".to_string()]);
    }
}
