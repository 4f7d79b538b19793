//! Control API: the operations the HTTP layer (and tests) call.
//!
//! Everything here is idempotent. Mode changes and reinstalls are handed to
//! the convergence driver and awaited; reads never block a writer.

use crate::convergence::{ConvergenceHandle, ConvergenceReport, ConvergenceState, Trigger};
use crate::error::ControlError;
use crate::metrics::{LinkReport, MetricsCollector, MetricsSnapshot, PathMetrics};
use crate::models::{Dpid, Epoch, MacAddr};
use crate::routing::{PathEngine, PathTable, Route, RoutingPolicy, SwitchPath};
use crate::topology::{TopologySnapshot, TopologyStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct ControlApi {
    store: Arc<TopologyStore>,
    convergence: ConvergenceHandle,
    metrics: Arc<MetricsCollector>,
    engine: PathEngine,
    max_k: usize,
}

impl ControlApi {
    pub fn new(
        store: Arc<TopologyStore>,
        convergence: ConvergenceHandle,
        metrics: Arc<MetricsCollector>,
        engine: PathEngine,
        max_k: usize,
    ) -> Self {
        Self { store, convergence, metrics, engine, max_k }
    }

    pub fn get_mode(&self) -> RoutingPolicy {
        self.convergence.policy()
    }

    /// Switches policy and waits for the resulting convergence. Asking for
    /// the active policy returns a no-op report without touching a switch.
    pub async fn set_mode(&self, policy: RoutingPolicy) -> Result<ConvergenceReport, ControlError> {
        self.convergence.request(Trigger::SetMode(policy)).await
    }

    /// Parses before anything is mutated; an unknown name changes nothing.
    pub async fn set_mode_named(&self, name: &str) -> Result<ConvergenceReport, ControlError> {
        let policy: RoutingPolicy = name.parse()?;
        self.set_mode(policy).await
    }

    pub async fn force_reinstall(&self) -> Result<ConvergenceReport, ControlError> {
        self.convergence.request(Trigger::Reinstall).await
    }

    pub fn get_topology_snapshot(&self) -> Arc<TopologySnapshot> {
        self.store.snapshot()
    }

    pub fn convergence_state(&self) -> ConvergenceState {
        self.convergence.state()
    }

    pub fn installed_paths(&self) -> Option<Arc<PathTable>> {
        self.convergence.installed_paths()
    }

    /// Waits until the fabric has been programmed for `epoch` or later.
    pub async fn converged(&self, epoch: Epoch) -> Result<ConvergenceReport, ControlError> {
        self.convergence.wait_for_epoch(epoch).await
    }

    pub fn is_halted(&self) -> bool {
        self.convergence.state().halted.is_some()
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.store.snapshot())
    }

    /// Metrics of the link joining two switches (lowest link id if several).
    pub fn link_metrics(&self, u: Dpid, v: Dpid) -> Result<LinkReport, ControlError> {
        let snapshot = self.store.snapshot();
        let link = snapshot.link_between(u, v).ok_or(ControlError::UnknownLink(u, v))?;
        self.metrics.link_report(&snapshot, &link.id).ok_or(ControlError::UnknownLink(u, v))
    }

    /// Metrics along the installed path of a host pair.
    pub fn path_metrics(&self, src: MacAddr, dst: MacAddr) -> Result<PathMetrics, ControlError> {
        let snapshot = self.store.snapshot();
        for mac in [src, dst] {
            if !snapshot.hosts.contains_key(&mac) {
                return Err(ControlError::UnknownHost(mac));
            }
        }
        let table = self.installed_paths().ok_or(ControlError::NoInstalledPath(src, dst))?;
        match table.route(src, dst) {
            Some(Route::Found(path)) => Ok(self.metrics.path_metrics(&snapshot, path)),
            _ => Err(ControlError::NoInstalledPath(src, dst)),
        }
    }

    /// Up to `k` switch paths under the active policy, cheapest first.
    pub fn k_shortest_paths(&self, src: Dpid, dst: Dpid, k: usize) -> Result<Vec<SwitchPath>, ControlError> {
        let snapshot = self.store.snapshot();
        Ok(self.engine.k_shortest_paths(&snapshot, self.get_mode(), src, dst, k, self.max_k)?)
    }
}
