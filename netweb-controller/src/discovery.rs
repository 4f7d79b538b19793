//! Discovery adapter: switch, link, host and port events into the store.
//!
//! Events arrive as tagged JSON (`{"type": "link_discovered", ...}`) on
//! `netweb/discovery/events@v1`, or directly as `DiscoveryEvent` values from
//! in-process sources such as the devkit.

use crate::error::TopologyError;
use crate::models::{Dpid, Endpoint, MacAddr, PortNo};
use crate::topology::{Applied, TopologyStore};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DISCOVERY_TOPIC: &str = "netweb/discovery/events@v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    SwitchConnected {
        dpid: Dpid,
        #[serde(default)]
        ports: Vec<PortNo>,
    },
    SwitchDisconnected {
        dpid: Dpid,
    },
    LinkDiscovered {
        src_dpid: Dpid,
        src_port: PortNo,
        dst_dpid: Dpid,
        dst_port: PortNo,
    },
    LinkLost {
        src_dpid: Dpid,
        src_port: PortNo,
        dst_dpid: Dpid,
        dst_port: PortNo,
    },
    HostObserved {
        mac: MacAddr,
        dpid: Dpid,
        port: PortNo,
        #[serde(default)]
        ip: Option<Ipv4Addr>,
    },
    PortStatus {
        dpid: Dpid,
        port: PortNo,
        up: bool,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("malformed discovery payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Rejected(#[from] TopologyError),
}

#[derive(Clone)]
pub struct DiscoveryAdapter {
    store: Arc<TopologyStore>,
}

impl DiscoveryAdapter {
    pub fn new(store: Arc<TopologyStore>) -> Self {
        Self { store }
    }

    pub fn apply(&self, event: DiscoveryEvent) -> Result<Applied, TopologyError> {
        debug!(?event, "discovery event");
        match event {
            DiscoveryEvent::SwitchConnected { dpid, ports } => Ok(self.store.apply_switch_connect(dpid, ports)),
            DiscoveryEvent::SwitchDisconnected { dpid } => self.store.apply_switch_disconnect(dpid),
            DiscoveryEvent::LinkDiscovered { src_dpid, src_port, dst_dpid, dst_port } => self
                .store
                .apply_link_up(Endpoint { dpid: src_dpid, port: src_port }, Endpoint { dpid: dst_dpid, port: dst_port }),
            DiscoveryEvent::LinkLost { src_dpid, src_port, dst_dpid, dst_port } => self
                .store
                .apply_link_down(Endpoint { dpid: src_dpid, port: src_port }, Endpoint { dpid: dst_dpid, port: dst_port }),
            DiscoveryEvent::HostObserved { mac, dpid, port, ip } => self.store.apply_host_seen(mac, dpid, port, ip),
            DiscoveryEvent::PortStatus { dpid, port, up } => self.store.apply_port_status(dpid, port, up),
        }
    }

    /// Parses and applies one JSON payload. Errors are returned, not fatal:
    /// the MQTT loop logs them and moves on.
    pub fn handle_payload(&self, payload: &[u8]) -> Result<Applied, DiscoveryError> {
        let event: DiscoveryEvent = serde_json::from_slice(payload)?;
        match self.apply(event) {
            Ok(applied) => Ok(applied),
            Err(e) => {
                warn!(error = %e, "discovery event rejected");
                Err(e.into())
            }
        }
    }
}
