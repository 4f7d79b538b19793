//! Identifiers and records shared by every controller component.
//!
//! Everything here is plain data: the topology store owns the live records,
//! other components only ever see clones inside an immutable snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// OpenFlow datapath id of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dpid(pub u64);

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNo(pub u32);

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic version of the topology graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ethernet address, serialized as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(MacParseError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        Ok(MacAddr(bytes))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

/// One side of a link: a port on a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub dpid: Dpid,
    pub port: PortNo,
}

impl Endpoint {
    pub fn new(dpid: u64, port: u32) -> Self {
        Self { dpid: Dpid(dpid), port: PortNo(port) }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-eth{}", self.dpid, self.port)
    }
}

/// Undirected link identity. `a` is always the smaller endpoint so both
/// discovery directions resolve to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl LinkId {
    pub fn new(x: Endpoint, y: Endpoint) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn touches(&self, dpid: Dpid) -> bool {
        self.a.dpid == dpid || self.b.dpid == dpid
    }

    pub fn uses(&self, endpoint: Endpoint) -> bool {
        self.a == endpoint || self.b == endpoint
    }

    /// Endpoint opposite to `from`, if `from` is one of ours.
    pub fn peer_of(&self, from: Endpoint) -> Option<Endpoint> {
        if self.a == from {
            Some(self.b)
        } else if self.b == from {
            Some(self.a)
        } else {
            None
        }
    }

    /// Whether this link joins the two switches, in either order.
    pub fn joins(&self, u: Dpid, v: Dpid) -> bool {
        (self.a.dpid == u && self.b.dpid == v) || (self.a.dpid == v && self.b.dpid == u)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub dpid: Dpid,
    pub ports: BTreeSet<PortNo>,
    pub state: SwitchState,
    /// Bumped each time the switch (re)connects. A new session means an
    /// empty flow table, whatever the controller remembers about the old one.
    pub session: u64,
}

impl Switch {
    pub fn is_connected(&self) -> bool {
        self.state == SwitchState::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub mac: MacAddr,
    pub ip: Option<Ipv4Addr>,
    pub attachment: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    /// Configured capacity in Mb/s; feeds the cost-based weight.
    pub bandwidth_mbps: f64,
}

/// Per switch-pair capacities used to annotate links as they are discovered.
#[derive(Debug, Clone)]
pub struct LinkCapacities {
    default_mbps: f64,
    table: HashMap<(Dpid, Dpid), f64>,
}

impl LinkCapacities {
    pub fn new(default_mbps: f64) -> Self {
        Self { default_mbps, table: HashMap::new() }
    }

    pub fn with(mut self, u: u64, v: u64, mbps: f64) -> Self {
        self.insert(Dpid(u), Dpid(v), mbps);
        self
    }

    pub fn insert(&mut self, u: Dpid, v: Dpid, mbps: f64) {
        self.table.insert(undirected_key(u, v), mbps);
    }

    pub fn lookup(&self, u: Dpid, v: Dpid) -> f64 {
        self.table.get(&undirected_key(u, v)).copied().unwrap_or(self.default_mbps)
    }
}

impl Default for LinkCapacities {
    fn default() -> Self {
        Self::new(10.0)
    }
}

fn undirected_key(u: Dpid, v: Dpid) -> (Dpid, Dpid) {
    if u <= v { (u, v) } else { (v, u) }
}
