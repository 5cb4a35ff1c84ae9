use crate::broker_mux::BrokerMux;
use crate::config::{DeviceCommand, DeviceMgmtConfig};
use crate::service_utils::publish_with_timeout;
use rumqttc::QoS;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

const UPTIME_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Posts the LAN address, listens for named commands on `<topic>cmd`, and
/// reports uptime (hours) and local time every hour. Never returns once a
/// topic is configured.
pub async fn run_device_mgmt(mux: Arc<BrokerMux>, config: DeviceMgmtConfig) {
    if config.topic.is_empty() {
        return;
    }

    if let Some(ip) = lan_address() {
        publish_with_timeout(
            &mux,
            &format!("{}IP", config.topic),
            QoS::AtLeastOnce,
            true,
            ip.to_string(),
        )
        .await;
    }

    let commands: Arc<[DeviceCommand]> = config.commands.clone().into();
    let result = mux
        .subscribe(&format!("{}cmd", config.topic), QoS::AtMostOnce, move |msg| {
            let payload = String::from_utf8_lossy(msg.payload()).to_string();
            info!("command: name={}", payload);

            if let Some(command) = find_command(&commands, &payload) {
                tokio::spawn(run_command(command.cmdline.clone()));
            }
        })
        .await;
    if let Err(e) = result {
        error!("command: subscribe: {}", e);
    }

    let mut ticker = interval(UPTIME_PERIOD);
    let mut uptime: u64 = 0;
    loop {
        ticker.tick().await;
        report_uptime(&mux, &config.topic, uptime).await;
        uptime += 1;
    }
}

/// First address that is not loopback.
fn lan_address() -> Option<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .find(|iface| !iface.is_loopback())
            .map(|iface| iface.ip()),
        Err(e) => {
            warn!("device: interfaces: {}", e);
            None
        }
    }
}

fn find_command<'a>(commands: &'a [DeviceCommand], name: &str) -> Option<&'a DeviceCommand> {
    commands.iter().find(|command| command.name == name)
}

async fn run_command(cmdline: String) {
    match Command::new("/bin/bash").arg("-c").arg(&cmdline).output().await {
        Ok(output) => {
            if !output.status.success() {
                error!("command: error={}", output.status);
            }
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            info!("command: result={}", String::from_utf8_lossy(&combined));
        }
        Err(e) => error!("command: error={}", e),
    }
}

async fn report_uptime(mux: &BrokerMux, base_topic: &str, uptime: u64) {
    publish_with_timeout(
        mux,
        &format!("{}uptime", base_topic),
        QoS::AtLeastOnce,
        true,
        uptime.to_string(),
    )
    .await;

    publish_with_timeout(
        mux,
        &format!("{}time", base_topic),
        QoS::AtLeastOnce,
        true,
        chrono::Local::now().to_rfc3339(),
    )
    .await;
}
