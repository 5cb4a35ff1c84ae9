use crate::broker_mux::BrokerMux;
use crate::config::StringsConfig;
use crate::job_runner::new_job_runner;
use crate::service_utils::publish_with_timeout;
use rand::seq::SliceRandom;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Publishes one of the configured strings, picked at random, on every firing.
pub fn init_strings(mux: Arc<BrokerMux>, config: &StringsConfig) -> Option<JoinHandle<()>> {
    if config.topic.is_empty() || config.strings.is_empty() {
        return None;
    }

    let topic = config.topic.clone();
    let strings: Arc<[String]> = config.strings.clone().into();

    new_job_runner("strings", &config.jobs, move || {
        let mux = mux.clone();
        let topic = topic.clone();
        let strings = strings.clone();
        async move { publish_random_string(&mux, &topic, &strings).await }
    })
    .run()
}

fn pick(strings: &[String]) -> Option<String> {
    strings.choose(&mut rand::thread_rng()).cloned()
}

async fn publish_random_string(mux: &BrokerMux, topic: &str, strings: &[String]) {
    let Some(text) = pick(strings) else {
        return;
    };

    debug!("strings: {}", text);
    publish_with_timeout(mux, topic, QoS::AtMostOnce, false, text).await;
}
