//! Path computation.
//!
//! `PathEngine::recompute` turns one topology snapshot and one policy into a
//! route (or an explicit no-path) for every ordered host pair. It is a pure
//! function of its inputs: same snapshot and policy, same table.

mod graph;
mod ksp;

pub use graph::Cost;

use crate::error::{PolicyError, RoutingError};
use crate::models::{Dpid, Epoch, Link, MacAddr, PortNo};
use crate::topology::TopologySnapshot;
use graph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Closed set of strategies; exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Fewest switches, BFS.
    #[serde(alias = "hops")]
    HopCount,
    /// Least aggregate link weight, Dijkstra.
    #[serde(alias = "distrak")]
    CostBased,
}

impl RoutingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingPolicy::HopCount => "hop_count",
            RoutingPolicy::CostBased => "cost_based",
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingPolicy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hop_count" | "hops" => Ok(RoutingPolicy::HopCount),
            "cost_based" | "distrak" => Ok(RoutingPolicy::CostBased),
            _ => Err(PolicyError::Unknown(s.to_string())),
        }
    }
}

/// Weight source for the cost-based policy. Must return a finite value > 0.
pub trait LinkWeight: Send + Sync {
    fn weight(&self, link: &Link) -> f64;
}

/// `1 / bandwidth`: a 100 Mb/s link costs a tenth of a 10 Mb/s one.
#[derive(Debug, Clone, Copy, Default)]
pub struct InverseBandwidth;

impl LinkWeight for InverseBandwidth {
    fn weight(&self, link: &Link) -> f64 {
        1.0 / link.bandwidth_mbps
    }
}

impl<F> LinkWeight for F
where
    F: Fn(&Link) -> f64 + Send + Sync,
{
    fn weight(&self, link: &Link) -> f64 {
        self(link)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub dpid: Dpid,
    pub out_port: PortNo,
}

/// End-to-end route between two hosts. The last hop egresses to the
/// destination host's port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Path {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub hops: Vec<Hop>,
    pub cost: f64,
}

impl Path {
    pub fn switches(&self) -> impl Iterator<Item = Dpid> + '_ {
        self.hops.iter().map(|h| h.dpid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Route {
    Found(Path),
    NoPath,
}

impl Route {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Route::Found(p) => Some(p),
            Route::NoPath => None,
        }
    }
}

/// Routes for every ordered host pair of one snapshot under one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTable {
    pub epoch: Epoch,
    pub policy: RoutingPolicy,
    pub routes: BTreeMap<(MacAddr, MacAddr), Route>,
}

impl PathTable {
    pub fn route(&self, src: MacAddr, dst: MacAddr) -> Option<&Route> {
        self.routes.get(&(src, dst))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.routes.values().filter_map(Route::path)
    }

    pub fn no_path_pairs(&self) -> Vec<(MacAddr, MacAddr)> {
        self.routes
            .iter()
            .filter(|(_, r)| matches!(r, Route::NoPath))
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn entries(&self) -> Vec<PathEntry<'_>> {
        self.routes.iter().map(|(&(src, dst), route)| PathEntry { src, dst, route }).collect()
    }
}

#[derive(Debug, Serialize)]
pub struct PathEntry<'a> {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub route: &'a Route,
}

/// Switch-level path returned by the k-shortest query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchPath {
    pub switches: Vec<Dpid>,
    pub cost: f64,
}

#[derive(Clone)]
pub struct PathEngine {
    weight: Arc<dyn LinkWeight>,
}

impl Default for PathEngine {
    fn default() -> Self {
        Self::new(Arc::new(InverseBandwidth))
    }
}

impl PathEngine {
    pub fn new(weight: Arc<dyn LinkWeight>) -> Self {
        Self { weight }
    }

    fn graph(&self, snapshot: &TopologySnapshot, policy: RoutingPolicy) -> Result<Graph, RoutingError> {
        match policy {
            RoutingPolicy::HopCount => Graph::build(snapshot, |_| 1.0),
            RoutingPolicy::CostBased => Graph::build(snapshot, |link| self.weight.weight(link)),
        }
    }

    /// Computes every ordered host pair. Fails only on an inconsistent
    /// snapshot; unreachable pairs are `Route::NoPath`.
    pub fn recompute(&self, snapshot: &TopologySnapshot, policy: RoutingPolicy) -> Result<PathTable, RoutingError> {
        let graph = self.graph(snapshot, policy)?;
        let mut routes = BTreeMap::new();
        let mut distances: HashMap<Dpid, graph::Distances> = HashMap::new();

        for dst in snapshot.hosts.values() {
            let dst_sw = dst.attachment.dpid;
            let dist = distances
                .entry(dst_sw)
                .or_insert_with(|| graph.distances_to(dst_sw, policy, &graph::Bans::default()));

            for src in snapshot.hosts.values() {
                if src.mac == dst.mac {
                    continue;
                }
                let walk = graph.trace(src.attachment.dpid, dst_sw, dist, &graph::Bans::default());
                let route = match walk {
                    Some(walk) => {
                        let mut hops: Vec<Hop> = walk.steps.iter().map(|&(dpid, out_port)| Hop { dpid, out_port }).collect();
                        hops.push(Hop { dpid: dst_sw, out_port: dst.attachment.port });
                        Route::Found(Path { src: src.mac, dst: dst.mac, hops, cost: walk.cost })
                    }
                    None => Route::NoPath,
                };
                routes.insert((src.mac, dst.mac), route);
            }
        }

        debug!(epoch = %snapshot.epoch, %policy, pairs = routes.len(), "paths recomputed");
        Ok(PathTable { epoch: snapshot.epoch, policy, routes })
    }

    /// Up to `k` loopless switch paths in increasing cost order (Yen).
    pub fn k_shortest_paths(
        &self,
        snapshot: &TopologySnapshot,
        policy: RoutingPolicy,
        src: Dpid,
        dst: Dpid,
        k: usize,
        max_k: usize,
    ) -> Result<Vec<SwitchPath>, RoutingError> {
        if k == 0 || k > max_k {
            return Err(RoutingError::InvalidK { k, max: max_k });
        }
        for dpid in [src, dst] {
            if !snapshot.switches.contains_key(&dpid) {
                return Err(RoutingError::UnknownSwitch(dpid));
            }
        }
        let graph = self.graph(snapshot, policy)?;
        Ok(ksp::yen(&graph, policy, src, dst, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{Endpoint, LinkCapacities};
    use crate::topology::TopologyStore;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    /// s1 - s2 - s3 line plus an optional s1 - s4 - s3 detour; h1@s1, h3@s3.
    fn topo(caps: LinkCapacities, detour: bool) -> TopologyStore {
        let s = TopologyStore::new(caps, EventBus::new(256));
        for d in 1..=4 {
            s.apply_switch_connect(Dpid(d), (1..=4).map(PortNo));
        }
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        s.apply_link_up(Endpoint::new(2, 3), Endpoint::new(3, 2)).unwrap();
        if detour {
            s.apply_link_up(Endpoint::new(1, 3), Endpoint::new(4, 2)).unwrap();
            s.apply_link_up(Endpoint::new(4, 3), Endpoint::new(3, 3)).unwrap();
        }
        s.apply_host_seen(mac(1), Dpid(1), PortNo(1), None).unwrap();
        s.apply_host_seen(mac(3), Dpid(3), PortNo(1), None).unwrap();
        s
    }

    fn switches(table: &PathTable, src: u8, dst: u8) -> Vec<u64> {
        table.route(mac(src), mac(dst)).and_then(Route::path).map(|p| p.switches().map(|d| d.0).collect()).unwrap_or_default()
    }

    #[test]
    fn policy_names_and_aliases() {
        assert_eq!("hops".parse::<RoutingPolicy>().unwrap(), RoutingPolicy::HopCount);
        assert_eq!("Cost-Based".parse::<RoutingPolicy>().unwrap(), RoutingPolicy::CostBased);
        assert_eq!("distrak".parse::<RoutingPolicy>().unwrap(), RoutingPolicy::CostBased);
        assert!(matches!("ecmp".parse::<RoutingPolicy>(), Err(PolicyError::Unknown(_))));
        let p: RoutingPolicy = serde_json::from_str("\"distrak\"").unwrap();
        assert_eq!(p, RoutingPolicy::CostBased);
    }

    #[test]
    fn line_topology_paths_both_directions() {
        let s = topo(LinkCapacities::default(), false);
        let table = PathEngine::default().recompute(&s.snapshot(), RoutingPolicy::HopCount).unwrap();
        assert_eq!(switches(&table, 1, 3), vec![1, 2, 3]);
        assert_eq!(switches(&table, 3, 1), vec![3, 2, 1]);
        let path = table.route(mac(1), mac(3)).and_then(Route::path).unwrap();
        assert_eq!(path.hops[0].out_port, PortNo(2));
        assert_eq!(path.hops[2].out_port, PortNo(1));
        assert_eq!(path.cost, 2.0);
    }

    #[test]
    fn hop_count_ties_prefer_lowest_switch_ids() {
        // s1-s2-s3 and s1-s4-s3 are equally long.
        let s = topo(LinkCapacities::default(), true);
        let table = PathEngine::default().recompute(&s.snapshot(), RoutingPolicy::HopCount).unwrap();
        assert_eq!(switches(&table, 1, 3), vec![1, 2, 3]);
        assert_eq!(switches(&table, 3, 1), vec![3, 2, 1]);
    }

    #[test]
    fn cost_based_follows_bandwidth() {
        let caps = LinkCapacities::new(10.0).with(1, 4, 100.0).with(4, 3, 100.0);
        let s = topo(caps, true);
        let engine = PathEngine::default();
        let hops = engine.recompute(&s.snapshot(), RoutingPolicy::HopCount).unwrap();
        let cost = engine.recompute(&s.snapshot(), RoutingPolicy::CostBased).unwrap();
        assert_eq!(switches(&hops, 1, 3), vec![1, 2, 3]);
        assert_eq!(switches(&cost, 1, 3), vec![1, 4, 3]);
    }

    #[test]
    fn weight_function_is_injectable() {
        let s = topo(LinkCapacities::default(), true);
        // Penalise anything touching s2.
        let engine = PathEngine::new(Arc::new(|l: &Link| if l.id.touches(Dpid(2)) { 10.0 } else { 1.0 }));
        let table = engine.recompute(&s.snapshot(), RoutingPolicy::CostBased).unwrap();
        assert_eq!(switches(&table, 1, 3), vec![1, 4, 3]);
    }

    #[test]
    fn partitions_yield_explicit_no_path() {
        let s = topo(LinkCapacities::default(), false);
        s.apply_link_down(Endpoint::new(2, 3), Endpoint::new(3, 2)).unwrap();
        let table = PathEngine::default().recompute(&s.snapshot(), RoutingPolicy::HopCount).unwrap();
        assert_eq!(table.route(mac(1), mac(3)), Some(&Route::NoPath));
        assert_eq!(table.no_path_pairs().len(), 2);
    }

    #[test]
    fn hosts_on_same_switch_get_single_hop() {
        let s = topo(LinkCapacities::default(), false);
        s.apply_host_seen(mac(4), Dpid(1), PortNo(4), None).unwrap();
        let table = PathEngine::default().recompute(&s.snapshot(), RoutingPolicy::HopCount).unwrap();
        let p = table.route(mac(1), mac(4)).and_then(Route::path).unwrap();
        assert_eq!(p.hops, vec![Hop { dpid: Dpid(1), out_port: PortNo(4) }]);
        assert_eq!(p.cost, 0.0);
    }

    #[test]
    fn paths_never_repeat_a_switch() {
        let s = topo(LinkCapacities::default(), true);
        for policy in [RoutingPolicy::HopCount, RoutingPolicy::CostBased] {
            let table = PathEngine::default().recompute(&s.snapshot(), policy).unwrap();
            for path in table.paths() {
                let mut seen: Vec<Dpid> = path.switches().collect();
                let len = seen.len();
                seen.sort();
                seen.dedup();
                assert_eq!(seen.len(), len);
            }
        }
    }

    #[test]
    fn dangling_link_is_a_data_integrity_error() {
        let s = topo(LinkCapacities::default(), false);
        let mut broken = (*s.snapshot()).clone();
        broken.switches.remove(&Dpid(2));
        let err = PathEngine::default().recompute(&broken, RoutingPolicy::HopCount).unwrap_err();
        assert!(matches!(err, RoutingError::DataIntegrity { .. }));
    }

    #[test]
    fn k_shortest_orders_by_cost() {
        let s = topo(LinkCapacities::default(), true);
        let engine = PathEngine::default();
        let paths = engine.k_shortest_paths(&s.snapshot(), RoutingPolicy::HopCount, Dpid(1), Dpid(3), 5, 10).unwrap();
        let seqs: Vec<Vec<u64>> = paths.iter().map(|p| p.switches.iter().map(|d| d.0).collect()).collect();
        assert_eq!(seqs, vec![vec![1, 2, 3], vec![1, 4, 3]]);
        assert!(engine.k_shortest_paths(&s.snapshot(), RoutingPolicy::HopCount, Dpid(1), Dpid(3), 0, 10).is_err());
        assert!(engine.k_shortest_paths(&s.snapshot(), RoutingPolicy::HopCount, Dpid(1), Dpid(9), 1, 10).is_err());
    }
}
