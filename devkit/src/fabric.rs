/*!
In-memory switch fabric implementing `SwitchTransport`.

Keeps one flow table per switch with OpenFlow overwrite semantics (same
match and priority replaces), records every southbound call, and can trace
a packet between two hosts along the installed entries. Switches can be
made to fail or to stall so timeouts and partial convergence can be tested.

A probe can watch host pairs: once a pair has been delivered end to end,
every later flow change that breaks its delivery is recorded as a
violation.
*/

use async_trait::async_trait;
use netweb_controller::error::SwitchError;
use netweb_controller::models::{Dpid, Endpoint, MacAddr, PortNo};
use netweb_controller::switch::{FlowAction, FlowMatch, FlowSelector, FlowSpec, PortCounters, SwitchTransport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

/// Guard against forwarding loops when tracing.
const MAX_TRACE_HOPS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricOp {
    Install { dpid: Dpid, flow: FlowSpec },
    Delete { dpid: Dpid, selector: FlowSelector },
    Stats { dpid: Dpid },
}

impl FabricOp {
    pub fn dpid(&self) -> Dpid {
        match self {
            FabricOp::Install { dpid, .. } | FabricOp::Delete { dpid, .. } | FabricOp::Stats { dpid } => *dpid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Reached the destination host through these switches.
    Delivered(Vec<Dpid>),
    /// No matching entry, or output to a dead port, at this switch.
    Dropped { at: Dpid },
    Looped,
    UnknownHost(MacAddr),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeViolation {
    pub pair: (MacAddr, MacAddr),
    /// Index into the op log of the change that broke delivery.
    pub op_index: usize,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy)]
struct AttachedHost {
    at: Endpoint,
    ip: Option<Ipv4Addr>,
}

#[derive(Default)]
struct FabricState {
    tables: BTreeMap<Dpid, BTreeMap<(FlowMatch, u16), FlowSpec>>,
    ops: Vec<FabricOp>,
    failing: HashSet<Dpid>,
    stalled: HashSet<Dpid>,
    wires: HashMap<Endpoint, Endpoint>,
    hosts: HashMap<MacAddr, AttachedHost>,
    counters: HashMap<Dpid, BTreeMap<PortNo, PortCounters>>,
    probes: Vec<Probe>,
    violations: Vec<ProbeViolation>,
}

struct Probe {
    pair: (MacAddr, MacAddr),
    armed: bool,
}

impl FabricState {
    fn packet_match(&self, src: MacAddr, dst: MacAddr) -> Option<FlowMatch> {
        let s = self.hosts.get(&src)?;
        let d = self.hosts.get(&dst)?;
        Some(match (s.ip, d.ip) {
            (Some(s), Some(d)) => FlowMatch::Ipv4 { src: s, dst: d },
            _ => FlowMatch::Eth { src, dst },
        })
    }

    /// Highest-priority entry of `dpid` that covers `packet`.
    fn lookup(&self, dpid: Dpid, packet: FlowMatch) -> Option<&FlowSpec> {
        self.tables
            .get(&dpid)?
            .values()
            .filter(|f| f.matches == packet || f.matches == FlowMatch::Any)
            .max_by_key(|f| f.priority)
    }

    fn deliver(&self, src: MacAddr, dst: MacAddr) -> Delivery {
        let (Some(from), Some(to)) = (self.hosts.get(&src), self.hosts.get(&dst)) else {
            let missing = if self.hosts.contains_key(&src) { dst } else { src };
            return Delivery::UnknownHost(missing);
        };
        let Some(packet) = self.packet_match(src, dst) else {
            return Delivery::UnknownHost(dst);
        };

        let mut at = from.at.dpid;
        let mut visited = Vec::new();
        for _ in 0..MAX_TRACE_HOPS {
            visited.push(at);
            let port = match self.lookup(at, packet).map(|f| f.action) {
                Some(FlowAction::Output { port }) => port,
                _ => return Delivery::Dropped { at },
            };
            let egress = Endpoint { dpid: at, port };
            if egress == to.at {
                return Delivery::Delivered(visited);
            }
            match self.wires.get(&egress) {
                Some(next) => at = next.dpid,
                None => return Delivery::Dropped { at },
            }
        }
        Delivery::Looped
    }

    fn run_probes(&mut self) {
        let op_index = self.ops.len().saturating_sub(1);
        let mut found = Vec::new();
        for probe in &self.probes {
            let delivery = self.deliver(probe.pair.0, probe.pair.1);
            found.push(delivery);
        }
        for (probe, delivery) in self.probes.iter_mut().zip(found) {
            if delivery.is_delivered() {
                probe.armed = true;
            } else if probe.armed {
                self.violations.push(ProbeViolation { pair: probe.pair, op_index, delivery });
            }
        }
    }
}

#[derive(Default)]
pub struct FakeFabric {
    state: Mutex<FabricState>,
}

impl FakeFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects two switch ports with a cable, both directions.
    pub fn wire(&self, a: Endpoint, b: Endpoint) {
        let mut st = self.state.lock();
        st.wires.insert(a, b);
        st.wires.insert(b, a);
    }

    pub fn unwire(&self, a: Endpoint, b: Endpoint) {
        let mut st = self.state.lock();
        st.wires.remove(&a);
        st.wires.remove(&b);
    }

    pub fn attach_host(&self, mac: MacAddr, ip: Option<Ipv4Addr>, at: Endpoint) {
        self.state.lock().hosts.insert(mac, AttachedHost { at, ip });
    }

    /// Every call to `dpid` fails with `Unreachable` until cleared.
    pub fn set_failing(&self, dpid: Dpid, failing: bool) {
        let mut st = self.state.lock();
        if failing {
            st.failing.insert(dpid);
        } else {
            st.failing.remove(&dpid);
        }
    }

    /// Calls to `dpid` never complete; the caller's timeout has to fire.
    pub fn set_stalled(&self, dpid: Dpid, stalled: bool) {
        let mut st = self.state.lock();
        if stalled {
            st.stalled.insert(dpid);
        } else {
            st.stalled.remove(&dpid);
        }
    }

    pub fn set_counters(&self, dpid: Dpid, counters: PortCounters) {
        self.state.lock().counters.entry(dpid).or_default().insert(counters.port, counters);
    }

    /// Adds traffic sent from `from` over its link: tx at `from`, rx at the
    /// wired peer, with `lost` packets never arriving.
    pub fn add_traffic(&self, from: Endpoint, packets: u64, bytes_per_packet: u64, lost: u64) {
        let mut st = self.state.lock();
        let Some(peer) = st.wires.get(&from).copied() else {
            return;
        };
        let tx = st.counters.entry(from.dpid).or_default().entry(from.port).or_insert(PortCounters {
            port: from.port,
            ..Default::default()
        });
        tx.tx_packets += packets;
        tx.tx_bytes += packets * bytes_per_packet;

        let delivered = packets.saturating_sub(lost);
        let rx = st.counters.entry(peer.dpid).or_default().entry(peer.port).or_insert(PortCounters {
            port: peer.port,
            ..Default::default()
        });
        rx.rx_packets += delivered;
        rx.rx_bytes += delivered * bytes_per_packet;
    }

    pub fn watch_pair(&self, src: MacAddr, dst: MacAddr) {
        let mut st = self.state.lock();
        st.probes.push(Probe { pair: (src, dst), armed: false });
        st.run_probes();
    }

    pub fn violations(&self) -> Vec<ProbeViolation> {
        self.state.lock().violations.clone()
    }

    pub fn deliver(&self, src: MacAddr, dst: MacAddr) -> Delivery {
        self.state.lock().deliver(src, dst)
    }

    pub fn table(&self, dpid: Dpid) -> Vec<FlowSpec> {
        self.state.lock().tables.get(&dpid).map(|t| t.values().cloned().collect()).unwrap_or_default()
    }

    pub fn entry(&self, dpid: Dpid, matches: FlowMatch, priority: u16) -> Option<FlowSpec> {
        self.state.lock().tables.get(&dpid)?.get(&(matches, priority)).cloned()
    }

    pub fn ops(&self) -> Vec<FabricOp> {
        self.state.lock().ops.clone()
    }

    /// Flow-changing calls only, stats polls excluded.
    pub fn flow_ops(&self) -> Vec<FabricOp> {
        self.state.lock().ops.iter().filter(|op| !matches!(op, FabricOp::Stats { .. })).cloned().collect()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Simulates a switch reboot: the table is gone.
    pub fn wipe(&self, dpid: Dpid) {
        self.state.lock().tables.remove(&dpid);
    }

    async fn gate(&self, dpid: Dpid) -> Result<(), SwitchError> {
        let (stalled, failing) = {
            let st = self.state.lock();
            (st.stalled.contains(&dpid), st.failing.contains(&dpid))
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(SwitchError::Unreachable(dpid));
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchTransport for FakeFabric {
    async fn install_flow(&self, dpid: Dpid, flow: &FlowSpec) -> Result<(), SwitchError> {
        self.gate(dpid).await?;
        let mut st = self.state.lock();
        st.ops.push(FabricOp::Install { dpid, flow: flow.clone() });
        st.tables.entry(dpid).or_default().insert((flow.matches, flow.priority), flow.clone());
        st.run_probes();
        Ok(())
    }

    async fn delete_flow(&self, dpid: Dpid, selector: &FlowSelector) -> Result<(), SwitchError> {
        self.gate(dpid).await?;
        let mut st = self.state.lock();
        st.ops.push(FabricOp::Delete { dpid, selector: *selector });
        if let Some(table) = st.tables.get_mut(&dpid) {
            match selector {
                FlowSelector::Strict { matches, priority } => {
                    table.remove(&(*matches, *priority));
                }
                FlowSelector::All => table.clear(),
            }
        }
        st.run_probes();
        Ok(())
    }

    async fn port_stats(&self, dpid: Dpid) -> Result<Vec<PortCounters>, SwitchError> {
        self.gate(dpid).await?;
        let mut st = self.state.lock();
        st.ops.push(FabricOp::Stats { dpid });
        Ok(st.counters.get(&dpid).map(|c| c.values().copied().collect()).unwrap_or_default())
    }
}
