//! Yen's k shortest loopless paths over the policy's weights.

use super::graph::{Bans, Graph};
use super::{RoutingPolicy, SwitchPath};
use crate::models::Dpid;

fn shortest(graph: &Graph, policy: RoutingPolicy, src: Dpid, dst: Dpid, bans: &Bans) -> Option<SwitchPath> {
    let dist = graph.distances_to(dst, policy, bans);
    let walk = graph.trace(src, dst, &dist, bans)?;
    let mut switches: Vec<Dpid> = walk.steps.iter().map(|&(dpid, _)| dpid).collect();
    switches.push(dst);
    Some(SwitchPath { switches, cost: walk.cost })
}

pub(crate) fn yen(graph: &Graph, policy: RoutingPolicy, src: Dpid, dst: Dpid, k: usize) -> Vec<SwitchPath> {
    let Some(first) = shortest(graph, policy, src, dst, &Bans::default()) else {
        return Vec::new();
    };
    let mut accepted = vec![first];
    let mut candidates: Vec<SwitchPath> = Vec::new();

    while accepted.len() < k {
        let last = accepted[accepted.len() - 1].switches.clone();
        for i in 0..last.len().saturating_sub(1) {
            let spur = last[i];
            let root = &last[..=i];

            let mut bans = Bans::default();
            for p in &accepted {
                if p.switches.len() > i + 1 && p.switches[..=i] == *root {
                    bans.ban_edge(p.switches[i], p.switches[i + 1]);
                }
            }
            for &node in &root[..i] {
                bans.ban_node(node);
            }

            let Some(spur_path) = shortest(graph, policy, spur, dst, &bans) else {
                continue;
            };
            let mut switches = root[..i].to_vec();
            switches.extend(spur_path.switches);
            let Some(cost) = graph.path_cost(&switches) else {
                continue;
            };
            let known = accepted.iter().chain(candidates.iter()).any(|p| p.switches == switches);
            if !known {
                candidates.push(SwitchPath { switches, cost });
            }
        }

        let best = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cost.total_cmp(&b.cost).then_with(|| a.switches.cmp(&b.switches)))
            .map(|(idx, _)| idx);
        match best {
            Some(idx) => accepted.push(candidates.swap_remove(idx)),
            None => break,
        }
    }
    accepted
}
