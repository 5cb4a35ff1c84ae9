use crate::broker_mux::BrokerMux;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{error, info};

/// Upper bound on how long a caller waits for a broker operation.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Publish on a separate task so the caller never waits on the broker. The
/// task itself gives up after `OPERATION_TIMEOUT`.
pub fn publish_detached(
    mux: Arc<BrokerMux>,
    address: String,
    qos: QoS,
    retain: bool,
    payload: impl Into<Vec<u8>>,
) {
    let payload = payload.into();
    tokio::spawn(async move {
        publish_with_timeout(&mux, &address, qos, retain, payload).await;
    });
}

/// Publish and wait up to `OPERATION_TIMEOUT`. Failures are logged, not retried.
pub async fn publish_with_timeout(
    mux: &BrokerMux,
    address: &str,
    qos: QoS,
    retain: bool,
    payload: impl Into<Vec<u8>>,
) -> bool {
    match timeout(OPERATION_TIMEOUT, mux.publish(address, qos, retain, payload)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("publish to '{}' failed: {}", address, e);
            false
        }
        Err(_) => {
            error!("publish to '{}' timed out after {:?}", address, OPERATION_TIMEOUT);
            false
        }
    }
}

/// Block until Ctrl-C. Every component runs for the life of the process, so
/// this is the only way out.
pub async fn handle_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        std::future::pending::<()>().await;
    }

    info!("Hub is shutting down...");
}
