//! Switch adjacency built from a snapshot, plus the two distance searches.
//!
//! Distances are always computed towards the destination; a path is then
//! read off by walking from the source to the lowest-id neighbour that stays
//! on a shortest route. That walk is what makes ties deterministic.

use super::RoutingPolicy;
use crate::error::RoutingError;
use crate::models::{Dpid, Link, PortNo};
use crate::topology::TopologySnapshot;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Totally ordered path cost, usable as a candidate-list key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost(pub f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub out_port: PortNo,
    pub weight: f64,
}

pub(crate) type Distances = HashMap<Dpid, f64>;

/// Nodes and undirected edges a search must avoid.
#[derive(Debug, Default)]
pub(crate) struct Bans {
    nodes: HashSet<Dpid>,
    edges: HashSet<(Dpid, Dpid)>,
}

impl Bans {
    pub fn ban_node(&mut self, dpid: Dpid) {
        self.nodes.insert(dpid);
    }

    pub fn ban_edge(&mut self, u: Dpid, v: Dpid) {
        self.edges.insert(ordered(u, v));
    }

    fn allows(&self, from: Dpid, to: Dpid) -> bool {
        !self.nodes.contains(&to) && !self.edges.contains(&ordered(from, to))
    }
}

fn ordered(u: Dpid, v: Dpid) -> (Dpid, Dpid) {
    if u <= v { (u, v) } else { (v, u) }
}

pub(crate) struct Walk {
    /// Each switch on the way with the port it forwards out of.
    pub steps: Vec<(Dpid, PortNo)>,
    pub cost: f64,
}

pub(crate) struct Graph {
    adj: BTreeMap<Dpid, BTreeMap<Dpid, Edge>>,
}

impl Graph {
    /// Checks referential integrity and collapses parallel links to the
    /// cheapest one (lowest port on equal weight).
    pub fn build(snapshot: &TopologySnapshot, weight: impl Fn(&Link) -> f64) -> Result<Self, RoutingError> {
        let integrity = |detail: String| RoutingError::DataIntegrity { epoch: snapshot.epoch, detail };

        let mut adj: BTreeMap<Dpid, BTreeMap<Dpid, Edge>> = snapshot
            .switches
            .values()
            .filter(|s| s.is_connected())
            .map(|s| (s.dpid, BTreeMap::new()))
            .collect();

        for link in snapshot.links.values() {
            for end in [link.id.a, link.id.b] {
                match snapshot.switches.get(&end.dpid) {
                    None => return Err(integrity(format!("link {} references unknown switch {}", link.id, end.dpid))),
                    Some(sw) if !sw.is_connected() => {
                        return Err(integrity(format!("link {} references disconnected switch {}", link.id, end.dpid)))
                    }
                    Some(_) => {}
                }
            }
            let w = weight(link);
            if !(w.is_finite() && w > 0.0) {
                return Err(RoutingError::InvalidWeight { link: link.id, weight: w });
            }
            for (from, to) in [(link.id.a, link.id.b), (link.id.b, link.id.a)] {
                let edges = adj.entry(from.dpid).or_default();
                let candidate = Edge { out_port: from.port, weight: w };
                let better = match edges.get(&to.dpid) {
                    None => true,
                    Some(cur) => w < cur.weight || (w == cur.weight && from.port < cur.out_port),
                };
                if better {
                    edges.insert(to.dpid, candidate);
                }
            }
        }

        for host in snapshot.hosts.values() {
            if !snapshot.switches.contains_key(&host.attachment.dpid) {
                return Err(integrity(format!("host {} attached to unknown switch {}", host.mac, host.attachment.dpid)));
            }
        }

        Ok(Self { adj })
    }

    pub fn edge(&self, u: Dpid, v: Dpid) -> Option<&Edge> {
        self.adj.get(&u).and_then(|edges| edges.get(&v))
    }

    /// Sum of edge weights along consecutive switches, `None` if broken.
    pub fn path_cost(&self, switches: &[Dpid]) -> Option<f64> {
        switches.windows(2).try_fold(0.0, |acc, pair| self.edge(pair[0], pair[1]).map(|e| acc + e.weight))
    }

    pub fn distances_to(&self, dst: Dpid, policy: RoutingPolicy, bans: &Bans) -> Distances {
        if !self.adj.contains_key(&dst) || bans.nodes.contains(&dst) {
            return Distances::new();
        }
        match policy {
            RoutingPolicy::HopCount => self.bfs(dst, bans),
            RoutingPolicy::CostBased => self.dijkstra(dst, bans),
        }
    }

    fn bfs(&self, root: Dpid, bans: &Bans) -> Distances {
        let mut dist = Distances::new();
        let mut queue = VecDeque::new();
        dist.insert(root, 0.0);
        queue.push_back(root);
        while let Some(u) = queue.pop_front() {
            let du = dist[&u];
            for (&v, edge) in self.adj.get(&u).into_iter().flatten() {
                if dist.contains_key(&v) || !bans.allows(u, v) {
                    continue;
                }
                dist.insert(v, du + edge.weight);
                queue.push_back(v);
            }
        }
        dist
    }

    fn dijkstra(&self, root: Dpid, bans: &Bans) -> Distances {
        let mut settled = Distances::new();
        let mut best: HashMap<Dpid, f64> = HashMap::new();
        let mut cand_list: BTreeMap<(Cost, Dpid), ()> = BTreeMap::new();
        cand_list.insert((Cost(0.0), root), ());
        best.insert(root, 0.0);

        while let Some(((Cost(du), u), ())) = cand_list.pop_first() {
            if settled.contains_key(&u) {
                continue;
            }
            settled.insert(u, du);
            for (&v, edge) in self.adj.get(&u).into_iter().flatten() {
                if settled.contains_key(&v) || !bans.allows(u, v) {
                    continue;
                }
                let dv = du + edge.weight;
                let prev = best.get(&v).copied();
                if prev.is_some_and(|old| old <= dv) {
                    continue;
                }
                if let Some(old) = prev {
                    cand_list.remove(&(Cost(old), v));
                }
                best.insert(v, dv);
                cand_list.insert((Cost(dv), v), ());
            }
        }
        settled
    }

    /// Walks from `src` to the destination `dist` was computed for, always
    /// taking the lowest-id neighbour that is still on a shortest route.
    pub fn trace(&self, src: Dpid, dst: Dpid, dist: &Distances, bans: &Bans) -> Option<Walk> {
        let cost = *dist.get(&src)?;
        let mut steps = Vec::new();
        let mut visited = HashSet::from([src]);
        let mut cur = src;

        while cur != dst {
            let d_cur = *dist.get(&cur)?;
            let (next, edge) = self.adj.get(&cur)?.iter().find(|(&n, e)| {
                !visited.contains(&n)
                    && bans.allows(cur, n)
                    && dist.get(&n).is_some_and(|&d_n| on_shortest(d_n + e.weight, d_cur))
            })?;
            steps.push((cur, edge.out_port));
            visited.insert(*next);
            cur = *next;
        }
        Some(Walk { steps, cost })
    }
}

fn on_shortest(via: f64, best: f64) -> bool {
    (via - best).abs() <= 1e-9 * via.abs().max(best.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Endpoint, LinkId, Switch, SwitchState};

    fn snapshot(links: &[(u64, u32, u64, u32, f64)]) -> TopologySnapshot {
        let mut snap = TopologySnapshot::default();
        for &(a, pa, b, pb, bw) in links {
            for d in [a, b] {
                snap.switches.entry(Dpid(d)).or_insert(Switch {
                    dpid: Dpid(d),
                    ports: Default::default(),
                    state: SwitchState::Connected,
                    session: 1,
                });
            }
            let id = LinkId::new(Endpoint::new(a, pa), Endpoint::new(b, pb));
            snap.links.insert(id, Link { id, bandwidth_mbps: bw });
        }
        snap
    }

    #[test]
    fn parallel_links_keep_cheapest_then_lowest_port() {
        let snap = snapshot(&[(1, 5, 2, 5, 10.0), (1, 3, 2, 3, 10.0), (1, 4, 2, 4, 100.0)]);
        let g = Graph::build(&snap, |l| 1.0 / l.bandwidth_mbps).unwrap();
        assert_eq!(g.edge(Dpid(1), Dpid(2)).unwrap().out_port, PortNo(4));
        let g = Graph::build(&snap, |_| 1.0).unwrap();
        assert_eq!(g.edge(Dpid(1), Dpid(2)).unwrap().out_port, PortNo(3));
    }

    #[test]
    fn dijkstra_prefers_cheap_long_route() {
        // 1-3 direct is expensive, 1-2-3 cheap.
        let snap = snapshot(&[(1, 1, 3, 1, 1.0), (1, 2, 2, 1, 100.0), (2, 2, 3, 2, 100.0)]);
        let g = Graph::build(&snap, |l| 1.0 / l.bandwidth_mbps).unwrap();
        let dist = g.distances_to(Dpid(3), RoutingPolicy::CostBased, &Bans::default());
        let walk = g.trace(Dpid(1), Dpid(3), &dist, &Bans::default()).unwrap();
        assert_eq!(walk.steps.iter().map(|s| s.0 .0).collect::<Vec<_>>(), vec![1, 2]);
        assert!((walk.cost - 0.02).abs() < 1e-12);

        let dist = g.distances_to(Dpid(3), RoutingPolicy::HopCount, &Bans::default());
        let walk = g.trace(Dpid(1), Dpid(3), &dist, &Bans::default()).unwrap();
        assert_eq!(walk.steps, vec![(Dpid(1), PortNo(1))]);
    }

    #[test]
    fn bans_remove_edges_and_nodes() {
        let snap = snapshot(&[(1, 1, 2, 1, 10.0), (2, 2, 3, 1, 10.0), (1, 2, 4, 1, 10.0), (4, 2, 3, 2, 10.0)]);
        let g = Graph::build(&snap, |_| 1.0).unwrap();
        let mut bans = Bans::default();
        bans.ban_edge(Dpid(2), Dpid(1));
        let dist = g.distances_to(Dpid(3), RoutingPolicy::HopCount, &bans);
        let walk = g.trace(Dpid(1), Dpid(3), &dist, &bans).unwrap();
        assert_eq!(walk.steps[0], (Dpid(1), PortNo(2)));

        bans.ban_node(Dpid(4));
        let dist = g.distances_to(Dpid(3), RoutingPolicy::HopCount, &bans);
        assert!(g.trace(Dpid(1), Dpid(3), &dist, &bans).is_none());
    }

    #[test]
    fn non_positive_weight_is_rejected() {
        let snap = snapshot(&[(1, 1, 2, 1, 10.0)]);
        let err = Graph::build(&snap, |_| 0.0).err().unwrap();
        assert!(matches!(err, RoutingError::InvalidWeight { .. }));
    }
}
