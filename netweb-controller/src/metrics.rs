/**
 * METRICS COLLECTOR - Link throughput and loss from port counters
 *
 * ROLE:
 * Polls every switch that terminates a link, keeps a short window of
 * counter pairs per link and derives rates from the two newest samples.
 *
 * OPERATION:
 * - fixed interval, all switches queried concurrently, each under the
 *   southbound timeout; a slow or dead switch only starves its own links
 * - window per link: bounded capacity, samples older than the retention
 *   horizon are evicted every tick
 * - derivation is a pure function of two samples; too few samples, a
 *   counter going backwards or a missed latest poll gives Unknown instead of
 *   a made-up number
 * - independent of convergence: never touches flows or the path table
 */

use crate::config::MetricsConf;
use crate::error::SwitchError;
use crate::models::{Dpid, Endpoint, LinkId, MacAddr};
use crate::routing::Path;
use crate::state::{new_rw_state, new_state, Shared, SharedRw};
use crate::switch::{bounded, PortCounters, SwitchTransport};
use crate::topology::{TopologySnapshot, TopologyStore};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Counters of both ends of a link at one instant; `a`/`b` follow `LinkId`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSample {
    pub at: Instant,
    pub a: PortCounters,
    pub b: PortCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DirectionalRate {
    pub throughput_bps: f64,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    InsufficientSamples,
    CounterRegression,
    NoElapsedTime,
    /// An end of the link did not answer the latest poll.
    MissedPoll,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkMetric {
    Known {
        /// Both directions summed.
        throughput_bps: f64,
        /// Mean of both directions.
        loss_ratio: f64,
        /// a -> b
        forward: DirectionalRate,
        /// b -> a
        reverse: DirectionalRate,
        interval_ms: u64,
    },
    Unknown {
        reason: UnknownReason,
    },
}

impl LinkMetric {
    pub fn is_known(&self) -> bool {
        matches!(self, LinkMetric::Known { .. })
    }

    /// Rate leaving `from`, when `from` is one end of `link`.
    pub fn towards(&self, link: &LinkId, from: Endpoint) -> Option<DirectionalRate> {
        match self {
            LinkMetric::Known { forward, reverse, .. } => {
                if link.a == from {
                    Some(*forward)
                } else if link.b == from {
                    Some(*reverse)
                } else {
                    None
                }
            }
            LinkMetric::Unknown { .. } => None,
        }
    }
}

fn direction(tx_from: (&PortCounters, &PortCounters), rx_to: (&PortCounters, &PortCounters), secs: f64) -> DirectionalRate {
    let (tx0, tx1) = tx_from;
    let (rx0, rx1) = rx_to;
    let sent_bytes = tx1.tx_bytes - tx0.tx_bytes;
    let sent_pkts = tx1.tx_packets - tx0.tx_packets;
    let got_pkts = rx1.rx_packets - rx0.rx_packets;
    let loss = if sent_pkts == 0 { 0.0 } else { 1.0 - got_pkts as f64 / sent_pkts as f64 };
    DirectionalRate { throughput_bps: sent_bytes as f64 * 8.0 / secs, loss_ratio: loss.clamp(0.0, 1.0) }
}

fn regressed(old: &PortCounters, new: &PortCounters) -> bool {
    new.tx_bytes < old.tx_bytes
        || new.rx_bytes < old.rx_bytes
        || new.tx_packets < old.tx_packets
        || new.rx_packets < old.rx_packets
}

/// Rates between two consecutive samples of one link.
pub fn derive(prev: &LinkSample, curr: &LinkSample) -> LinkMetric {
    if regressed(&prev.a, &curr.a) || regressed(&prev.b, &curr.b) {
        return LinkMetric::Unknown { reason: UnknownReason::CounterRegression };
    }
    let elapsed = curr.at.saturating_duration_since(prev.at);
    if elapsed.is_zero() {
        return LinkMetric::Unknown { reason: UnknownReason::NoElapsedTime };
    }
    let secs = elapsed.as_secs_f64();
    let forward = direction((&prev.a, &curr.a), (&prev.b, &curr.b), secs);
    let reverse = direction((&prev.b, &curr.b), (&prev.a, &curr.a), secs);
    LinkMetric::Known {
        throughput_bps: forward.throughput_bps + reverse.throughput_bps,
        loss_ratio: (forward.loss_ratio + reverse.loss_ratio) / 2.0,
        forward,
        reverse,
        interval_ms: elapsed.as_millis() as u64,
    }
}

#[derive(Debug, Clone)]
pub struct LinkWindow {
    samples: VecDeque<LinkSample>,
    capacity: usize,
    missed: bool,
}

impl LinkWindow {
    pub fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity: capacity.max(2), missed: false }
    }

    pub fn push(&mut self, sample: LinkSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.missed = false;
    }

    /// The latest poll produced no sample; held until the next push.
    pub fn mark_missed(&mut self) {
        self.missed = true;
    }

    pub fn evict_older_than(&mut self, now: Instant, horizon: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn metric(&self) -> LinkMetric {
        if self.missed {
            return LinkMetric::Unknown { reason: UnknownReason::MissedPoll };
        }
        let n = self.samples.len();
        if n < 2 {
            return LinkMetric::Unknown { reason: UnknownReason::InsufficientSamples };
        }
        derive(&self.samples[n - 2], &self.samples[n - 1])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub link: LinkId,
    pub bandwidth_mbps: f64,
    pub samples: usize,
    pub metric: LinkMetric,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkAggregate {
    pub total_throughput_bps: f64,
    pub mean_loss_ratio: Option<f64>,
    pub links_known: usize,
    pub links_unknown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(with = "time::serde::rfc3339::option")]
    pub sampled_at: Option<OffsetDateTime>,
    pub links: Vec<LinkReport>,
    pub network: NetworkAggregate,
}

#[derive(Debug, Clone, Serialize)]
pub struct HopMetric {
    pub from: Dpid,
    pub to: Dpid,
    pub link: Option<LinkId>,
    pub throughput_bps: Option<f64>,
    pub loss_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathMetrics {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub hops: Vec<HopMetric>,
    /// Smallest directional throughput among known hops.
    pub bottleneck_bps: Option<f64>,
    /// Sum of known hop losses, capped at 1.
    pub loss_ratio: f64,
    /// False when at least one hop had no usable metric.
    pub complete: bool,
}

/// Outcome of one polling round.
#[derive(Debug, Default)]
pub struct SampleSummary {
    pub polled: usize,
    pub failed: Vec<(Dpid, SwitchError)>,
    pub links_sampled: usize,
}

pub struct MetricsCollector {
    transport: Arc<dyn SwitchTransport>,
    store: Arc<TopologyStore>,
    windows: SharedRw<HashMap<LinkId, LinkWindow>>,
    last_sampled: Shared<Option<OffsetDateTime>>,
    conf: MetricsConf,
    timeout: Duration,
}

impl MetricsCollector {
    pub fn new(transport: Arc<dyn SwitchTransport>, store: Arc<TopologyStore>, conf: MetricsConf, timeout: Duration) -> Self {
        Self {
            transport,
            store,
            windows: new_rw_state(HashMap::new()),
            last_sampled: new_state(None),
            conf,
            timeout,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.conf.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let summary = self.sample_once().await;
                debug!(polled = summary.polled, sampled = summary.links_sampled, failed = summary.failed.len(), "metrics tick");
            }
        })
    }

    /// One polling round over every switch that terminates a link.
    pub async fn sample_once(&self) -> SampleSummary {
        let snapshot = self.store.snapshot();
        let dpids: BTreeSet<Dpid> = snapshot.links.keys().flat_map(|l| [l.a.dpid, l.b.dpid]).collect();

        let fetches = dpids.iter().map(|&dpid| async move {
            let result = bounded(dpid, self.timeout, self.transport.port_stats(dpid)).await;
            (dpid, result)
        });
        let results = join_all(fetches).await;
        let now = Instant::now();

        let mut summary = SampleSummary { polled: dpids.len(), ..Default::default() };
        let mut counters: HashMap<Endpoint, PortCounters> = HashMap::new();
        for (dpid, result) in results {
            match result {
                Ok(ports) => {
                    for c in ports {
                        counters.insert(Endpoint { dpid, port: c.port }, c);
                    }
                }
                Err(e) => {
                    warn!(%dpid, error = %e, "port stats unavailable");
                    summary.failed.push((dpid, e));
                }
            }
        }

        let mut windows = self.windows.write();
        windows.retain(|id, _| snapshot.links.contains_key(id));
        for id in snapshot.links.keys() {
            if let (Some(a), Some(b)) = (counters.get(&id.a), counters.get(&id.b)) {
                windows
                    .entry(*id)
                    .or_insert_with(|| LinkWindow::new(self.conf.window_capacity))
                    .push(LinkSample { at: now, a: *a, b: *b });
                summary.links_sampled += 1;
            } else if let Some(window) = windows.get_mut(id) {
                window.mark_missed();
            }
        }
        let retention = self.conf.retention();
        for window in windows.values_mut() {
            window.evict_older_than(now, retention);
        }
        drop(windows);

        *self.last_sampled.lock() = Some(OffsetDateTime::now_utc());
        summary
    }

    pub fn derive_metrics(&self, link: &LinkId) -> LinkMetric {
        self.windows
            .read()
            .get(link)
            .map(LinkWindow::metric)
            .unwrap_or(LinkMetric::Unknown { reason: UnknownReason::InsufficientSamples })
    }

    pub fn last_sampled(&self) -> Option<OffsetDateTime> {
        *self.last_sampled.lock()
    }

    pub fn link_report(&self, snapshot: &TopologySnapshot, link: &LinkId) -> Option<LinkReport> {
        let bandwidth_mbps = snapshot.links.get(link)?.bandwidth_mbps;
        let windows = self.windows.read();
        let window = windows.get(link);
        Some(LinkReport {
            link: *link,
            bandwidth_mbps,
            samples: window.map(LinkWindow::len).unwrap_or(0),
            metric: window
                .map(LinkWindow::metric)
                .unwrap_or(LinkMetric::Unknown { reason: UnknownReason::InsufficientSamples }),
        })
    }

    pub fn snapshot(&self, topology: &TopologySnapshot) -> MetricsSnapshot {
        let links: Vec<LinkReport> = topology.links.keys().filter_map(|id| self.link_report(topology, id)).collect();

        let mut total = 0.0;
        let mut loss_sum = 0.0;
        let mut known = 0;
        for report in &links {
            if let LinkMetric::Known { throughput_bps, loss_ratio, .. } = report.metric {
                total += throughput_bps;
                loss_sum += loss_ratio;
                known += 1;
            }
        }
        let network = NetworkAggregate {
            total_throughput_bps: total,
            mean_loss_ratio: if known == 0 { None } else { Some(loss_sum / known as f64) },
            links_known: known,
            links_unknown: links.len() - known,
        };
        MetricsSnapshot { sampled_at: self.last_sampled(), links, network }
    }

    /// Per-hop rates along `path`, in its direction of travel.
    pub fn path_metrics(&self, topology: &TopologySnapshot, path: &Path) -> PathMetrics {
        let mut hops = Vec::new();
        for pair in path.hops.windows(2) {
            let egress = Endpoint { dpid: pair[0].dpid, port: pair[0].out_port };
            let link = topology.link_at(egress).map(|l| l.id).filter(|id| id.joins(pair[0].dpid, pair[1].dpid));
            let rate = link.and_then(|id| self.derive_metrics(&id).towards(&id, egress));
            hops.push(HopMetric {
                from: pair[0].dpid,
                to: pair[1].dpid,
                link,
                throughput_bps: rate.map(|r| r.throughput_bps),
                loss_ratio: rate.map(|r| r.loss_ratio),
            });
        }

        let bottleneck_bps = hops.iter().filter_map(|h| h.throughput_bps).reduce(f64::min);
        let loss_ratio = hops.iter().filter_map(|h| h.loss_ratio).sum::<f64>().min(1.0);
        let complete = hops.iter().all(|h| h.throughput_bps.is_some());
        PathMetrics { src: path.src, dst: path.dst, hops, bottleneck_bps, loss_ratio, complete }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{LinkCapacities, PortNo};
    use crate::routing::Hop;
    use crate::switch::{FlowSelector, FlowSpec};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    fn counters(port: u32, tx_bytes: u64, rx_bytes: u64, tx_packets: u64, rx_packets: u64) -> PortCounters {
        PortCounters { port: PortNo(port), tx_bytes, rx_bytes, tx_packets, rx_packets }
    }

    fn link() -> LinkId {
        LinkId::new(Endpoint::new(1, 2), Endpoint::new(2, 2))
    }

    #[test]
    fn derive_computes_directional_rates() {
        let t0 = Instant::now();
        let prev = LinkSample { at: t0, a: counters(2, 0, 0, 0, 0), b: counters(2, 0, 0, 0, 0) };
        let curr = LinkSample {
            at: t0 + Duration::from_secs(2),
            a: counters(2, 250_000, 0, 100, 0),
            b: counters(2, 0, 250_000, 0, 90),
        };
        match derive(&prev, &curr) {
            LinkMetric::Known { throughput_bps, loss_ratio, forward, reverse, interval_ms } => {
                assert_eq!(forward.throughput_bps, 1_000_000.0);
                assert!((forward.loss_ratio - 0.1).abs() < 1e-12);
                assert_eq!(reverse.throughput_bps, 0.0);
                assert_eq!(reverse.loss_ratio, 0.0);
                assert_eq!(throughput_bps, 1_000_000.0);
                assert!((loss_ratio - 0.05).abs() < 1e-12);
                assert_eq!(interval_ms, 2000);
            }
            other => panic!("expected known metric, got {other:?}"),
        }
    }

    #[test]
    fn regression_gives_unknown() {
        let t0 = Instant::now();
        let prev = LinkSample { at: t0, a: counters(2, 500, 0, 5, 0), b: counters(2, 0, 500, 0, 5) };
        let curr = LinkSample { at: t0 + Duration::from_secs(1), a: counters(2, 100, 0, 1, 0), b: counters(2, 0, 600, 0, 6) };
        assert_eq!(derive(&prev, &curr), LinkMetric::Unknown { reason: UnknownReason::CounterRegression });
    }

    #[test]
    fn more_received_than_sent_clamps_to_zero_loss() {
        let t0 = Instant::now();
        let prev = LinkSample { at: t0, a: counters(2, 0, 0, 0, 0), b: counters(2, 0, 0, 0, 0) };
        let curr = LinkSample { at: t0 + Duration::from_secs(1), a: counters(2, 10, 0, 1, 0), b: counters(2, 0, 10, 0, 3) };
        let rate = derive(&prev, &curr).towards(&link(), link().a).unwrap();
        assert_eq!(rate.loss_ratio, 0.0);
    }

    #[test]
    fn window_is_bounded_and_needs_two_samples() {
        let t0 = Instant::now();
        let mut w = LinkWindow::new(3);
        assert_eq!(w.metric(), LinkMetric::Unknown { reason: UnknownReason::InsufficientSamples });
        for i in 0..5u64 {
            w.push(LinkSample {
                at: t0 + Duration::from_secs(i),
                a: counters(2, i * 100, 0, i, 0),
                b: counters(2, 0, i * 100, 0, i),
            });
        }
        assert_eq!(w.len(), 3);
        assert!(w.metric().is_known());
        w.mark_missed();
        assert_eq!(w.metric(), LinkMetric::Unknown { reason: UnknownReason::MissedPoll });
        w.push(LinkSample { at: t0 + Duration::from_secs(5), a: counters(2, 500, 0, 5, 0), b: counters(2, 0, 500, 0, 5) });
        assert!(w.metric().is_known());
        w.evict_older_than(t0 + Duration::from_secs(10), Duration::from_secs(5));
        assert!(w.is_empty());
    }

    #[derive(Default)]
    struct StatsOnly {
        ports: Mutex<HashMap<Dpid, Vec<PortCounters>>>,
        down: Mutex<HashSet<Dpid>>,
    }

    #[async_trait]
    impl SwitchTransport for StatsOnly {
        async fn install_flow(&self, _dpid: Dpid, _flow: &FlowSpec) -> Result<(), SwitchError> {
            Ok(())
        }

        async fn delete_flow(&self, _dpid: Dpid, _selector: &FlowSelector) -> Result<(), SwitchError> {
            Ok(())
        }

        async fn port_stats(&self, dpid: Dpid) -> Result<Vec<PortCounters>, SwitchError> {
            if self.down.lock().contains(&dpid) {
                return std::future::pending().await;
            }
            Ok(self.ports.lock().get(&dpid).cloned().unwrap_or_default())
        }
    }

    fn triangle() -> Arc<TopologyStore> {
        let store = Arc::new(TopologyStore::new(LinkCapacities::default(), EventBus::new(64)));
        for d in 1..=3 {
            store.apply_switch_connect(Dpid(d), (1..=3).map(PortNo));
        }
        store.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        store.apply_link_up(Endpoint::new(2, 3), Endpoint::new(3, 2)).unwrap();
        store
    }

    fn conf() -> MetricsConf {
        MetricsConf { poll_interval_ms: 1000, window_capacity: 8, retention_secs: 30 }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_switch_only_degrades_its_links() {
        let store = triangle();
        let transport = Arc::new(StatsOnly::default());
        transport.down.lock().insert(Dpid(3));
        let collector = MetricsCollector::new(transport.clone(), store.clone(), conf(), Duration::from_millis(100));

        for step in 1..=2u64 {
            transport.ports.lock().insert(Dpid(1), vec![counters(2, step * 1000, 0, step * 10, 0)]);
            transport.ports.lock().insert(Dpid(2), vec![counters(2, 0, step * 1000, 0, step * 10), counters(3, 0, 0, 0, 0)]);
            let summary = collector.sample_once().await;
            assert_eq!(summary.failed.len(), 1);
            assert_eq!(summary.links_sampled, 1);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert!(collector.derive_metrics(&link()).is_known());
        let far = LinkId::new(Endpoint::new(2, 3), Endpoint::new(3, 2));
        assert!(!collector.derive_metrics(&far).is_known());

        let snap = collector.snapshot(&store.snapshot());
        assert_eq!(snap.network.links_known, 1);
        assert_eq!(snap.network.links_unknown, 1);
        assert!(snap.sampled_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_going_silent_drops_its_known_rates() {
        let store = triangle();
        let transport = Arc::new(StatsOnly::default());
        let collector = MetricsCollector::new(transport.clone(), store.clone(), conf(), Duration::from_millis(100));

        for step in 1..=2u64 {
            transport.ports.lock().insert(Dpid(1), vec![counters(2, step * 1250, 0, step, 0)]);
            transport.ports.lock().insert(Dpid(2), vec![counters(2, 0, step * 1250, 0, step)]);
            collector.sample_once().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(collector.derive_metrics(&link()).is_known());

        transport.down.lock().insert(Dpid(2));
        let summary = collector.sample_once().await;
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(collector.derive_metrics(&link()), LinkMetric::Unknown { reason: UnknownReason::MissedPoll });

        transport.down.lock().remove(&Dpid(2));
        tokio::time::advance(Duration::from_secs(1)).await;
        collector.sample_once().await;
        assert!(collector.derive_metrics(&link()).is_known());
    }

    #[tokio::test(start_paused = true)]
    async fn path_metrics_follow_travel_direction() {
        let store = triangle();
        let transport = Arc::new(StatsOnly::default());
        let collector = MetricsCollector::new(transport.clone(), store.clone(), conf(), Duration::from_millis(100));

        for step in 0..=1u64 {
            // s1 -> s2 carries 1 Mb/s with 10% loss, s2 -> s3 carries 2 Mb/s clean.
            transport.ports.lock().insert(Dpid(1), vec![counters(2, step * 125_000, 0, step * 100, 0)]);
            transport.ports.lock().insert(
                Dpid(2),
                vec![counters(2, 0, step * 125_000, 0, step * 90), counters(3, step * 250_000, 0, step * 50, 0)],
            );
            transport.ports.lock().insert(Dpid(3), vec![counters(2, 0, step * 250_000, 0, step * 50)]);
            collector.sample_once().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let path = Path {
            src: MacAddr([0, 0, 0, 0, 0, 1]),
            dst: MacAddr([0, 0, 0, 0, 0, 3]),
            hops: vec![
                Hop { dpid: Dpid(1), out_port: PortNo(2) },
                Hop { dpid: Dpid(2), out_port: PortNo(3) },
                Hop { dpid: Dpid(3), out_port: PortNo(1) },
            ],
            cost: 2.0,
        };
        let m = collector.path_metrics(&store.snapshot(), &path);
        assert!(m.complete);
        assert_eq!(m.hops.len(), 2);
        assert_eq!(m.bottleneck_bps, Some(1_000_000.0));
        assert!((m.loss_ratio - 0.1).abs() < 1e-12);
    }
}
