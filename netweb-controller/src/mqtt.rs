use crate::config::MqttConf;
use crate::discovery::{DiscoveryAdapter, DiscoveryError, DISCOVERY_TOPIC};
use crate::health::HealthTracker;
use crate::switch_bridge::{MqttSwitchBridge, RESPONSE_TOPIC};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(conf.client_id.clone(), conf.host.clone(), conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(5)));
    AsyncClient::new(opts, 64)
}

/// Drives the event loop: discovery events into the store, switch replies
/// into the bridge. Subscriptions are renewed on every ConnAck since the
/// session is not persistent.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    discovery: DiscoveryAdapter,
    bridge: Arc<MqttSwitchBridge>,
    health: HealthTracker,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    health.mark_mqtt_connected();
                    for topic in [DISCOVERY_TOPIC, RESPONSE_TOPIC] {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!(topic, error = ?e, "MQTT subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => match p.topic.as_str() {
                    RESPONSE_TOPIC => bridge.handle_response(&p.payload),
                    DISCOVERY_TOPIC => match discovery.handle_payload(&p.payload) {
                        Ok(applied) if applied.changed => debug!(epoch = %applied.epoch, "topology advanced"),
                        Ok(_) => {}
                        // Rejections are already logged by the adapter.
                        Err(DiscoveryError::Rejected(_)) => {}
                        Err(e) => warn!(error = %e, "dropping discovery payload"),
                    },
                    other => debug!(topic = other, "ignoring publish"),
                },
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = ?e, "MQTT error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
