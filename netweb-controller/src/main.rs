/**
 * NETWEB CONTROLLER - Entry point
 *
 * ROLE: loads configuration, connects to the MQTT broker, starts the
 * control plane and serves the REST API.
 *
 * ARCHITECTURE: discovery events in over MQTT, flow and stats requests out
 * to the switch agents over MQTT, operators over HTTP.
 */

use anyhow::Context;
use netweb_controller::config::load_config;
use netweb_controller::events::spawn_event_publisher;
use netweb_controller::health::HealthTracker;
use netweb_controller::http::{self, AppState};
use netweb_controller::mqtt;
use netweb_controller::runtime::{Controller, ControllerOptions};
use netweb_controller::switch_bridge::MqttSwitchBridge;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netweb_controller=info")))
        .init();

    let config = load_config().await.context("loading controller configuration")?;
    if config.http.api_key.is_none() {
        warn!("no API key configured, the REST API is open");
    }

    let health = HealthTracker::new();
    let (client, eventloop) = mqtt::create_mqtt_client(&config.mqtt);
    let bridge = Arc::new(MqttSwitchBridge::new(client.clone(), config.southbound.timeout()));

    let mut controller = Controller::start(&config, bridge.clone(), ControllerOptions::default());
    controller.track(mqtt::spawn_mqtt_listener(
        client.clone(),
        eventloop,
        controller.discovery.clone(),
        bridge,
        health.clone(),
    ));
    controller.track(spawn_event_publisher(&controller.events, client.clone()));
    controller.track(health.spawn_health_publisher(client, controller.control.clone(), Duration::from_secs(30)));

    let app = http::build_router(AppState {
        control: controller.control.clone(),
        health,
        events: controller.events.clone(),
        api_key: config.http.api_key.clone(),
    });

    let listener = TcpListener::bind(&config.http.addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http.addr))?;
    info!(addr = %config.http.addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    controller.shutdown();
    Ok(())
}
