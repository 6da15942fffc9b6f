mod config;
mod device_registry;
mod models;
mod mqtt_service;
mod publisher;
mod rest_server;
mod service_utils;
mod stats;

use crate::config::Config;
use crate::mqtt_service::{MqttConfig, MqttService};
use crate::rest_server::{run_rest_server, GatewayState};
use crate::service_utils::{
    shutdown_mqtt_service, start_mqtt_service, LocalClock, SHUTDOWN_GRACE,
};
use crate::stats::Stats;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    let clock = match LocalClock::from_hours(config.display_utc_offset_hours) {
        Ok(clock) => clock,
        Err(e) => {
            error!("Invalid display offset: {}", e);
            return;
        }
    };

    let mqtt_service = MqttService::new(MqttConfig::from_config(&config));
    let supervisor = start_mqtt_service(mqtt_service.clone());

    let state = GatewayState {
        sink: mqtt_service.clone(),
        stats: Stats::new(),
        devices: config.devices.clone(),
        broker_url: config.mqtt_broker_url.clone(),
        topic: config.mqtt_topic.clone(),
        clock,
    };

    info!(
        "CMAS API server running on http://{}:{}/api",
        config.http_address, config.http_port
    );

    // Returns once Rocket has handled a shutdown signal
    if let Err(e) = run_rest_server(state, config.http_address, config.http_port).await {
        error!("REST server failed: {}", e);
    }

    shutdown_mqtt_service(mqtt_service, supervisor, SHUTDOWN_GRACE).await;
    info!("All services shut down successfully.");
}
