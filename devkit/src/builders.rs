/*!
Builders for discovery events as they arrive on `netweb/discovery/events@v1`.
*/

use netweb_controller::discovery::DiscoveryEvent;
use netweb_controller::models::{Dpid, MacAddr, PortNo};
use serde_json::Value;
use std::net::Ipv4Addr;

/// `00:00:00:00:00:nn`, the host naming used across the scenarios.
pub fn host_mac(n: u8) -> MacAddr {
    MacAddr([0, 0, 0, 0, 0, n])
}

/// `10.0.0.n`
pub fn host_ip(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, n)
}

pub struct DiscoveryMessageBuilder;

impl DiscoveryMessageBuilder {
    pub fn switch_connected(dpid: u64, ports: impl IntoIterator<Item = u32>) -> DiscoveryEvent {
        DiscoveryEvent::SwitchConnected { dpid: Dpid(dpid), ports: ports.into_iter().map(PortNo).collect() }
    }

    pub fn switch_disconnected(dpid: u64) -> DiscoveryEvent {
        DiscoveryEvent::SwitchDisconnected { dpid: Dpid(dpid) }
    }

    pub fn link_discovered(src: (u64, u32), dst: (u64, u32)) -> DiscoveryEvent {
        DiscoveryEvent::LinkDiscovered {
            src_dpid: Dpid(src.0),
            src_port: PortNo(src.1),
            dst_dpid: Dpid(dst.0),
            dst_port: PortNo(dst.1),
        }
    }

    pub fn link_lost(src: (u64, u32), dst: (u64, u32)) -> DiscoveryEvent {
        DiscoveryEvent::LinkLost {
            src_dpid: Dpid(src.0),
            src_port: PortNo(src.1),
            dst_dpid: Dpid(dst.0),
            dst_port: PortNo(dst.1),
        }
    }

    pub fn host_observed(mac: MacAddr, at: (u64, u32), ip: Option<Ipv4Addr>) -> DiscoveryEvent {
        DiscoveryEvent::HostObserved { mac, dpid: Dpid(at.0), port: PortNo(at.1), ip }
    }

    pub fn port_status(dpid: u64, port: u32, up: bool) -> DiscoveryEvent {
        DiscoveryEvent::PortStatus { dpid: Dpid(dpid), port: PortNo(port), up }
    }

    /// Wire form, as an agent would publish it.
    pub fn to_json(event: &DiscoveryEvent) -> Value {
        serde_json::to_value(event).unwrap_or(Value::Null)
    }

    pub fn to_payload(event: &DiscoveryEvent) -> Vec<u8> {
        serde_json::to_vec(event).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_matches_the_topic_contract() {
        let json = DiscoveryMessageBuilder::to_json(&DiscoveryMessageBuilder::link_discovered((1, 2), (2, 3)));
        assert_eq!(json["type"], "link_discovered");
        assert_eq!(json["src_dpid"], 1);
        assert_eq!(json["dst_port"], 3);

        let host = DiscoveryMessageBuilder::to_json(&DiscoveryMessageBuilder::host_observed(
            host_mac(7),
            (4, 1),
            Some(host_ip(7)),
        ));
        assert_eq!(host["mac"], "00:00:00:00:00:07");
        assert_eq!(host["ip"], "10.0.0.7");
    }
}
