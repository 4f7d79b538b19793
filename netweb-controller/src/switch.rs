//! Southbound boundary: what the controller asks of a switch.
//!
//! The wire transport lives behind `SwitchTransport`; the MQTT bridge
//! implements it in production and the devkit fabric in tests.

use crate::error::SwitchError;
use crate::models::{Dpid, MacAddr, PortNo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const ETH_TYPE_LLDP: u16 = 0x88cc;
pub const PRIORITY_LLDP: u16 = 500;
pub const PRIORITY_HOST_PAIR: u16 = 100;
pub const PRIORITY_TABLE_MISS: u16 = 0;

/// Match fields of a flow entry. Ordered so rule sets diff deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowMatch {
    /// Matches everything; only used for the table-miss rule.
    Any,
    EthType { eth_type: u16 },
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    Arp { spa: Ipv4Addr, tpa: Ipv4Addr },
    Eth { src: MacAddr, dst: MacAddr },
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowMatch::Any => write!(f, "*"),
            FlowMatch::EthType { eth_type } => write!(f, "eth_type={eth_type:#06x}"),
            FlowMatch::Ipv4 { src, dst } => write!(f, "ip {src}->{dst}"),
            FlowMatch::Arp { spa, tpa } => write!(f, "arp {spa}->{tpa}"),
            FlowMatch::Eth { src, dst } => write!(f, "eth {src}->{dst}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowAction {
    Output { port: PortNo },
    Controller,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(rename = "match")]
    pub matches: FlowMatch,
    pub action: FlowAction,
    pub priority: u16,
    /// Generation of the convergence that installed it.
    pub cookie: u64,
}

/// What a delete targets: one exact entry, or the whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowSelector {
    Strict {
        #[serde(rename = "match")]
        matches: FlowMatch,
        priority: u16,
    },
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub port: PortNo,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

#[async_trait]
pub trait SwitchTransport: Send + Sync {
    async fn install_flow(&self, dpid: Dpid, flow: &FlowSpec) -> Result<(), SwitchError>;

    async fn delete_flow(&self, dpid: Dpid, selector: &FlowSelector) -> Result<(), SwitchError>;

    async fn port_stats(&self, dpid: Dpid) -> Result<Vec<PortCounters>, SwitchError>;
}

/// Bounds one exchange with a switch.
pub async fn bounded<T, F>(dpid: Dpid, timeout: Duration, fut: F) -> Result<T, SwitchError>
where
    F: Future<Output = Result<T, SwitchError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SwitchError::Timeout { dpid, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_stalls_into_timeouts() {
        let stalled = std::future::pending::<Result<(), SwitchError>>();
        let err = bounded(Dpid(4), Duration::from_millis(200), stalled).await.unwrap_err();
        assert_eq!(err, SwitchError::Timeout { dpid: Dpid(4), timeout: Duration::from_millis(200) });

        let ok = bounded(Dpid(4), Duration::from_millis(200), async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn flow_spec_wire_shape() {
        let spec = FlowSpec {
            matches: FlowMatch::EthType { eth_type: ETH_TYPE_LLDP },
            action: FlowAction::Controller,
            priority: PRIORITY_LLDP,
            cookie: 3,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["match"]["kind"], "eth_type");
        assert_eq!(json["match"]["eth_type"], 0x88cc);
        assert_eq!(json["action"]["kind"], "controller");
        assert_eq!(spec.matches.to_string(), "eth_type=0x88cc");
    }

    #[test]
    fn port_counters_default_to_zero() {
        let c: PortCounters = serde_json::from_value(serde_json::json!({
            "port": 2, "tx_bytes": 0, "rx_bytes": 0, "tx_packets": 0, "rx_packets": 0
        }))
        .unwrap();
        assert_eq!(c, PortCounters { port: PortNo(2), ..Default::default() });
        assert_eq!(PortCounters::default().port, PortNo(0));
    }
}
