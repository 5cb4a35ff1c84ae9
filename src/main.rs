mod broker_mux;
mod config;
mod device_mgmt;
mod images;
mod job_runner;
mod mirror;
mod models;
mod mqtt_service;
mod sdr;
mod service_utils;
mod strings;
mod temp_sensors;
mod weather;

use crate::broker_mux::BrokerMux;
use crate::config::Config;
use crate::service_utils::handle_shutdown;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    // Load configuration first; it decides the log level.
    let config = Config::from_env();

    let level = match &config {
        Ok(cfg) if cfg.debug => Level::DEBUG,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    if config.debug {
        info!("DEBUG");
    }

    // Blocks until every broker is up.
    let mux = BrokerMux::connect(&config.brokers).await;

    sdr::init_sdr(mux.clone(), &config.sdr);

    images::init_remote_images(mux.clone(), &config.matrix.remote);
    temp_sensors::init_temp_sensors(mux.clone(), &config.matrix.sensors).await;
    weather::init_weather(mux.clone(), &config.matrix.weather);
    images::init_local_images(mux.clone(), &config.matrix.local);
    strings::init_strings(mux.clone(), &config.matrix.strings);
    mirror::init_mirror(mux.clone(), &config.matrix.mirror).await;

    tokio::spawn(device_mgmt::run_device_mgmt(
        mux.clone(),
        config.device_mgmt.clone(),
    ));

    info!("Hub is running.");
    handle_shutdown().await;
}
