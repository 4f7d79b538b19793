/**
 * EVENT BUS - Push channel of controller notifications
 *
 * ROLE:
 * Fans out topology, mode and convergence notifications to whoever listens:
 * the SSE endpoint, the MQTT publisher task, and tests.
 *
 * OPERATION:
 * - tokio broadcast channel, bounded; slow receivers lag and skip ahead
 * - publishing never blocks and never fails when nobody listens
 * - the MQTT publisher serializes each event as JSON on
 *   `netweb/controller/events@v1`
 */

use crate::convergence::Outcome;
use crate::models::{Dpid, Epoch, LinkId, MacAddr, PortNo};
use crate::routing::RoutingPolicy;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::net::Ipv4Addr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const EVENTS_TOPIC: &str = "netweb/controller/events@v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    SwitchEnter { dpid: Dpid, epoch: Epoch },
    SwitchLeave { dpid: Dpid, epoch: Epoch },
    LinkAdd { link: LinkId, bandwidth_mbps: f64, epoch: Epoch },
    LinkDelete { link: LinkId, epoch: Epoch },
    HostAdd { mac: MacAddr, ip: Option<Ipv4Addr>, dpid: Dpid, port: PortNo, epoch: Epoch },
    HostDelete { mac: MacAddr, epoch: Epoch },
    PortStatus { dpid: Dpid, port: PortNo, up: bool, epoch: Epoch },
    /// Emitted once per effective store mutation, after the specific event.
    TopologyChanged { epoch: Epoch },
    ModeChanged { from: RoutingPolicy, to: RoutingPolicy },
    Converged {
        generation: u64,
        epoch: Epoch,
        policy: RoutingPolicy,
        outcome: Outcome,
        installed: usize,
        removed: usize,
        failures: usize,
    },
}

impl ControllerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::SwitchEnter { .. } => "switch_enter",
            ControllerEvent::SwitchLeave { .. } => "switch_leave",
            ControllerEvent::LinkAdd { .. } => "link_add",
            ControllerEvent::LinkDelete { .. } => "link_delete",
            ControllerEvent::HostAdd { .. } => "host_add",
            ControllerEvent::HostDelete { .. } => "host_delete",
            ControllerEvent::PortStatus { .. } => "port_status",
            ControllerEvent::TopologyChanged { .. } => "topology_changed",
            ControllerEvent::ModeChanged { .. } => "mode_changed",
            ControllerEvent::Converged { .. } => "converged",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ControllerEvent) {
        debug!(kind = event.kind(), "event");
        // Err only means there is no subscriber right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }
}

/// Forwards every bus event to MQTT until the bus closes.
pub fn spawn_event_publisher(bus: &EventBus, client: AsyncClient) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = match serde_json::to_vec(&event) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "cannot serialize event");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(EVENTS_TOPIC, QoS::AtLeastOnce, false, payload).await {
                        warn!(error = ?e, kind = event.kind(), "failed to publish event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event publisher lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
