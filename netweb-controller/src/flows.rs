/**
 * FLOW PROGRAMMER - Paths to per-switch forwarding entries
 *
 * ROLE:
 * Turns a path table into flow entries and drives every switch towards it,
 * keeping a ledger of what each switch holds so reruns only send the diff.
 *
 * OPERATION:
 * - base rules first (LLDP to controller, table-miss drop) on switches that
 *   lack them
 * - installs run in rounds by distance to the destination host: a hop is
 *   rewritten only after everything downstream of it already forwards on
 *   the new path, so traffic on a routed pair is never dropped mid-way
 * - removals run last and only retract entries no longer wanted
 * - a failing switch is isolated: its remaining work is skipped, pairs that
 *   depend on it keep their previous entries, other switches carry on
 * - the cancel flag is checked between switches; a superseded run stops
 *   there and leaves the ledger matching what was actually sent
 */

use crate::error::SwitchError;
use crate::models::{Dpid, Epoch, MacAddr};
use crate::routing::{PathTable, RoutingPolicy};
use crate::switch::{
    bounded, FlowAction, FlowMatch, FlowSelector, FlowSpec, SwitchTransport, ETH_TYPE_LLDP, PRIORITY_HOST_PAIR,
    PRIORITY_LLDP, PRIORITY_TABLE_MISS,
};
use crate::topology::TopologySnapshot;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type RuleKey = (FlowMatch, u16);
type Pair = (MacAddr, MacAddr);

/// Which convergence produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowTag {
    pub generation: u64,
    pub epoch: Epoch,
    pub policy: RoutingPolicy,
}

#[derive(Debug, Clone)]
struct InstalledRule {
    action: FlowAction,
    pair: Pair,
    tag: FlowTag,
}

#[derive(Debug, Default)]
struct SwitchLedger {
    /// Connect session of the switch this ledger describes.
    session: u64,
    base: bool,
    rules: BTreeMap<RuleKey, InstalledRule>,
}

/// Set by whoever wants the running convergence to stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvergeOptions<'a> {
    /// Reinstall everything regardless of the ledger.
    pub force: bool,
    pub cancel: &'a CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Base,
    Install,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchFailure {
    pub dpid: Dpid,
    pub phase: Phase,
    #[serde(serialize_with = "as_display")]
    pub error: SwitchError,
}

fn as_display<S: Serializer>(error: &SwitchError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgramReport {
    pub generation: u64,
    pub installed: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Entries not sent because their switch, or a switch downstream on the
    /// same path, failed earlier in the run.
    pub skipped: usize,
    pub failures: Vec<SwitchFailure>,
    pub superseded: bool,
}

struct HopRule {
    pair: Pair,
    dpid: Dpid,
    key: RuleKey,
    action: FlowAction,
}

/// Desired entries, bucketed by distance from the destination host.
struct RulePlan {
    rounds: Vec<Vec<HopRule>>,
    wanted: HashMap<Dpid, HashSet<RuleKey>>,
}

impl RulePlan {
    fn build(table: &PathTable, snapshot: &TopologySnapshot) -> Self {
        let mut rounds: Vec<Vec<HopRule>> = Vec::new();
        let mut wanted: HashMap<Dpid, HashSet<RuleKey>> = HashMap::new();

        for path in table.paths() {
            let pair = (path.src, path.dst);
            let src_ip = snapshot.hosts.get(&path.src).and_then(|h| h.ip);
            let dst_ip = snapshot.hosts.get(&path.dst).and_then(|h| h.ip);
            let matches = pair_matches(path.src, path.dst, src_ip, dst_ip);

            for (distance, hop) in path.hops.iter().rev().enumerate() {
                if rounds.len() <= distance {
                    rounds.resize_with(distance + 1, Vec::new);
                }
                for m in &matches {
                    let key = (*m, PRIORITY_HOST_PAIR);
                    wanted.entry(hop.dpid).or_default().insert(key);
                    rounds[distance].push(HopRule {
                        pair,
                        dpid: hop.dpid,
                        key,
                        action: FlowAction::Output { port: hop.out_port },
                    });
                }
            }
        }
        for round in &mut rounds {
            round.sort_by_key(|r| r.dpid);
        }
        Self { rounds, wanted }
    }
}

/// IPv4 and ARP entries when both ends have an address, otherwise MAC.
fn pair_matches(src: MacAddr, dst: MacAddr, src_ip: Option<Ipv4Addr>, dst_ip: Option<Ipv4Addr>) -> Vec<FlowMatch> {
    match (src_ip, dst_ip) {
        (Some(s), Some(d)) => vec![FlowMatch::Ipv4 { src: s, dst: d }, FlowMatch::Arp { spa: s, tpa: d }],
        _ => vec![FlowMatch::Eth { src, dst }],
    }
}

pub fn base_rules(cookie: u64) -> [FlowSpec; 2] {
    [
        FlowSpec {
            matches: FlowMatch::EthType { eth_type: ETH_TYPE_LLDP },
            action: FlowAction::Controller,
            priority: PRIORITY_LLDP,
            cookie,
        },
        FlowSpec { matches: FlowMatch::Any, action: FlowAction::Drop, priority: PRIORITY_TABLE_MISS, cookie },
    ]
}

enum RuleOutcome {
    Installed,
    Unchanged,
}

pub struct FlowProgrammer {
    transport: Arc<dyn SwitchTransport>,
    timeout: Duration,
    generation: u64,
    ledger: BTreeMap<Dpid, SwitchLedger>,
}

impl FlowProgrammer {
    pub fn new(transport: Arc<dyn SwitchTransport>, timeout: Duration) -> Self {
        Self { transport, timeout, generation: 0, ledger: BTreeMap::new() }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Host-pair entries the ledger believes `dpid` holds.
    pub fn installed_on(&self, dpid: Dpid) -> usize {
        self.ledger.get(&dpid).map(|l| l.rules.len()).unwrap_or(0)
    }

    pub fn tag_of(&self, dpid: Dpid, matches: FlowMatch) -> Option<FlowTag> {
        self.ledger.get(&dpid)?.rules.get(&(matches, PRIORITY_HOST_PAIR)).map(|r| r.tag)
    }

    pub async fn converge(
        &mut self,
        table: &PathTable,
        snapshot: &TopologySnapshot,
        opts: ConvergeOptions<'_>,
    ) -> ProgramReport {
        self.generation += 1;
        let tag = FlowTag { generation: self.generation, epoch: table.epoch, policy: table.policy };
        let mut report = ProgramReport { generation: tag.generation, ..Default::default() };

        let connected = snapshot.connected_switches();
        // A switch that went away, or came back since the last run, lost its
        // table; its ledger starts from scratch.
        self.ledger.retain(|dpid, ledger| {
            snapshot.switches.get(dpid).is_some_and(|sw| sw.is_connected() && sw.session == ledger.session)
        });
        for sw in snapshot.switches.values().filter(|sw| sw.is_connected()) {
            self.ledger.entry(sw.dpid).or_insert_with(|| SwitchLedger { session: sw.session, ..Default::default() });
        }

        let plan = RulePlan::build(table, snapshot);
        let mut failed: BTreeSet<Dpid> = BTreeSet::new();
        let mut blocked: HashSet<Pair> = HashSet::new();

        for &dpid in &connected {
            if opts.cancel.is_cancelled() {
                return self.superseded(report);
            }
            if let Err(error) = self.ensure_base(dpid, tag.generation, opts.force).await {
                self.fail(&mut report, &mut failed, dpid, Phase::Base, error);
            }
        }

        for round in &plan.rounds {
            let mut current: Option<Dpid> = None;
            for rule in round {
                if current != Some(rule.dpid) {
                    if opts.cancel.is_cancelled() {
                        return self.superseded(report);
                    }
                    current = Some(rule.dpid);
                }
                if failed.contains(&rule.dpid) || blocked.contains(&rule.pair) || !connected.contains(&rule.dpid) {
                    blocked.insert(rule.pair);
                    report.skipped += 1;
                    continue;
                }
                match self.apply_rule(rule, tag, opts.force).await {
                    Ok(RuleOutcome::Installed) => report.installed += 1,
                    Ok(RuleOutcome::Unchanged) => report.unchanged += 1,
                    Err(error) => {
                        blocked.insert(rule.pair);
                        self.fail(&mut report, &mut failed, rule.dpid, Phase::Install, error);
                    }
                }
            }
        }

        for &dpid in &connected {
            if failed.contains(&dpid) {
                continue;
            }
            if opts.cancel.is_cancelled() {
                return self.superseded(report);
            }
            let empty = HashSet::new();
            let wanted = plan.wanted.get(&dpid).unwrap_or(&empty);
            match self.remove_stale(dpid, wanted, &blocked).await {
                Ok(n) => report.removed += n,
                Err((n, error)) => {
                    report.removed += n;
                    self.fail(&mut report, &mut failed, dpid, Phase::Remove, error);
                }
            }
        }

        info!(
            generation = tag.generation,
            epoch = %tag.epoch,
            policy = %tag.policy,
            installed = report.installed,
            unchanged = report.unchanged,
            removed = report.removed,
            failures = report.failures.len(),
            "flows converged"
        );
        report
    }

    fn superseded(&self, mut report: ProgramReport) -> ProgramReport {
        debug!(generation = report.generation, "convergence superseded");
        report.superseded = true;
        report
    }

    fn fail(&self, report: &mut ProgramReport, failed: &mut BTreeSet<Dpid>, dpid: Dpid, phase: Phase, error: SwitchError) {
        warn!(%dpid, ?phase, %error, "switch failed during convergence");
        failed.insert(dpid);
        report.failures.push(SwitchFailure { dpid, phase, error });
    }

    async fn ensure_base(&mut self, dpid: Dpid, cookie: u64, force: bool) -> Result<(), SwitchError> {
        let ledger = self.ledger.entry(dpid).or_default();
        if ledger.base && !force {
            return Ok(());
        }
        ledger.base = false;
        for spec in base_rules(cookie) {
            bounded(dpid, self.timeout, self.transport.install_flow(dpid, &spec)).await?;
        }
        ledger.base = true;
        debug!(%dpid, "base rules installed");
        Ok(())
    }

    async fn apply_rule(&mut self, rule: &HopRule, tag: FlowTag, force: bool) -> Result<RuleOutcome, SwitchError> {
        let ledger = self.ledger.entry(rule.dpid).or_default();
        if !force {
            if let Some(existing) = ledger.rules.get_mut(&rule.key) {
                if existing.action == rule.action {
                    existing.tag = tag;
                    existing.pair = rule.pair;
                    return Ok(RuleOutcome::Unchanged);
                }
            }
        }
        let spec = FlowSpec { matches: rule.key.0, action: rule.action, priority: rule.key.1, cookie: tag.generation };
        bounded(rule.dpid, self.timeout, self.transport.install_flow(rule.dpid, &spec)).await?;
        ledger.rules.insert(rule.key, InstalledRule { action: rule.action, pair: rule.pair, tag });
        Ok(RuleOutcome::Installed)
    }

    /// Deletes entries `dpid` should no longer hold. Entries of pairs whose
    /// new path could not be completed stay, so their old path keeps working.
    async fn remove_stale(
        &mut self,
        dpid: Dpid,
        wanted: &HashSet<RuleKey>,
        blocked: &HashSet<Pair>,
    ) -> Result<usize, (usize, SwitchError)> {
        let Some(ledger) = self.ledger.get_mut(&dpid) else {
            return Ok(0);
        };
        let stale: Vec<RuleKey> = ledger
            .rules
            .iter()
            .filter(|(key, rule)| !wanted.contains(*key) && !blocked.contains(&rule.pair))
            .map(|(key, _)| *key)
            .collect();

        let mut removed = 0;
        for key in stale {
            let selector = FlowSelector::Strict { matches: key.0, priority: key.1 };
            if let Err(error) = bounded(dpid, self.timeout, self.transport.delete_flow(dpid, &selector)).await {
                return Err((removed, error));
            }
            ledger.rules.remove(&key);
            removed += 1;
        }
        Ok(removed)
    }
}
