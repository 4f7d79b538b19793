/**
 * CONVERGENCE DRIVER - The one task allowed to reprogram the fabric
 *
 * ROLE:
 * Serializes every convergence: topology changes, mode switches and forced
 * reinstalls all funnel into this task, which recomputes paths and hands
 * them to the flow programmer.
 *
 * OPERATION:
 * - idle until the topology moves or a request arrives, then waits a short
 *   quiet period so discovery bursts share one run
 * - while a run is in flight, a newer topology or a mode/reinstall request
 *   cancels it; callers waiting on the cancelled run get the report of the
 *   run that finally completes
 * - a path computation failure aborts before any flow is touched and holds
 *   until the topology moves on, the mode changes or a reinstall is forced
 * - state (active policy, installed paths, last report) is published on a
 *   `watch` channel for the control API
 */

use crate::error::ControlError;
use crate::events::{ControllerEvent, EventBus};
use crate::flows::{CancelFlag, ConvergeOptions, FlowProgrammer, ProgramReport, SwitchFailure};
use crate::models::{Epoch, MacAddr};
use crate::routing::{PathEngine, PathTable, RoutingPolicy};
use crate::topology::TopologySnapshot;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every switch reached the target state.
    Completed,
    /// Finished, but some switches failed and keep older entries.
    Degraded,
    /// Path computation refused the snapshot; nothing was touched.
    Aborted,
    /// Nothing to do.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub generation: u64,
    pub epoch: Epoch,
    pub policy: RoutingPolicy,
    pub outcome: Outcome,
    pub installed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failures: Vec<SwitchFailure>,
    pub routed_pairs: usize,
    pub no_path: Vec<(MacAddr, MacAddr)>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_ms: u64,
}

impl ConvergenceReport {
    fn empty(generation: u64, epoch: Epoch, policy: RoutingPolicy, outcome: Outcome) -> Self {
        Self {
            generation,
            epoch,
            policy,
            outcome,
            installed: 0,
            unchanged: 0,
            removed: 0,
            skipped: 0,
            failures: Vec::new(),
            routed_pairs: 0,
            no_path: Vec::new(),
            error: None,
            started_at: OffsetDateTime::now_utc(),
            elapsed_ms: 0,
        }
    }

    fn from_program(program: ProgramReport, table: &PathTable) -> Self {
        let outcome = if program.failures.is_empty() { Outcome::Completed } else { Outcome::Degraded };
        Self {
            installed: program.installed,
            unchanged: program.unchanged,
            removed: program.removed,
            skipped: program.skipped,
            failures: program.failures,
            routed_pairs: table.paths().count(),
            no_path: table.no_path_pairs(),
            ..Self::empty(program.generation, table.epoch, table.policy, outcome)
        }
    }

    pub fn touched_flows(&self) -> bool {
        self.installed > 0 || self.removed > 0
    }
}

/// What the control API can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    SetMode(RoutingPolicy),
    Reinstall,
}

struct ConvergeRequest {
    trigger: Trigger,
    reply: oneshot::Sender<ConvergenceReport>,
}

#[derive(Debug, Clone)]
pub struct ConvergenceState {
    pub policy: RoutingPolicy,
    /// Table of the last run that finished.
    pub installed: Option<Arc<PathTable>>,
    pub last: Option<ConvergenceReport>,
    pub halted: Option<String>,
}

/// Cheap, cloneable front of the driver task.
#[derive(Clone)]
pub struct ConvergenceHandle {
    requests: mpsc::Sender<ConvergeRequest>,
    state: watch::Receiver<ConvergenceState>,
}

impl ConvergenceHandle {
    pub fn policy(&self) -> RoutingPolicy {
        self.state.borrow().policy
    }

    pub fn state(&self) -> ConvergenceState {
        self.state.borrow().clone()
    }

    pub fn installed_paths(&self) -> Option<Arc<PathTable>> {
        self.state.borrow().installed.clone()
    }

    pub async fn request(&self, trigger: Trigger) -> Result<ConvergenceReport, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ConvergeRequest { trigger, reply })
            .await
            .map_err(|_| ControlError::Unavailable)?;
        rx.await.map_err(|_| ControlError::Unavailable)
    }

    /// Resolves once a run for `epoch` or later has finished.
    pub async fn wait_for_epoch(&self, epoch: Epoch) -> Result<ConvergenceReport, ControlError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| s.last.as_ref().is_some_and(|r| r.epoch >= epoch))
            .await
            .map_err(|_| ControlError::Unavailable)?;
        state.last.clone().ok_or(ControlError::Unavailable)
    }
}

/// Pending work accumulated between runs.
struct Intake {
    requests: mpsc::Receiver<ConvergeRequest>,
    topology: watch::Receiver<Arc<TopologySnapshot>>,
    state: watch::Sender<ConvergenceState>,
    events: EventBus,
    waiters: Vec<oneshot::Sender<ConvergenceReport>>,
    policy: RoutingPolicy,
    generation: u64,
    force: bool,
    dirty: bool,
    /// A run is handing entries to the flow programmer right now.
    in_flight: bool,
    requests_closed: bool,
    topology_closed: bool,
}

impl Intake {
    fn has_work(&self) -> bool {
        self.dirty || self.force || !self.waiters.is_empty()
    }

    fn finished(&self) -> bool {
        self.topology_closed && (self.requests_closed || !self.has_work())
    }

    /// Folds a request into the pending work. Returns true when a run in
    /// flight no longer reflects what was asked for.
    fn absorb(&mut self, request: ConvergeRequest) -> bool {
        match request.trigger {
            // The active mode is still being programmed: answer with that run.
            Trigger::SetMode(policy) if policy == self.policy && (self.in_flight || self.has_work()) => {
                self.waiters.push(request.reply);
                false
            }
            Trigger::SetMode(policy) if policy == self.policy && self.state.borrow().halted.is_none() => {
                let epoch = self.topology.borrow().epoch;
                let noop = ConvergenceReport::empty(self.generation, epoch, policy, Outcome::Noop);
                let _ = request.reply.send(noop);
                false
            }
            Trigger::SetMode(policy) if policy == self.policy => {
                self.dirty = true;
                self.waiters.push(request.reply);
                false
            }
            Trigger::SetMode(policy) => {
                let from = self.policy;
                self.policy = policy;
                info!(%from, to = %policy, "routing mode changed");
                self.state.send_modify(|s| s.policy = policy);
                self.events.publish(ControllerEvent::ModeChanged { from, to: policy });
                self.dirty = true;
                self.waiters.push(request.reply);
                true
            }
            Trigger::Reinstall => {
                info!("forced reinstall requested");
                self.force = true;
                self.dirty = true;
                self.waiters.push(request.reply);
                true
            }
        }
    }

    fn on_request(&mut self, request: Option<ConvergeRequest>) -> bool {
        match request {
            Some(r) => self.absorb(r),
            None => {
                self.requests_closed = true;
                false
            }
        }
    }

    fn on_topology(&mut self, changed: Result<(), watch::error::RecvError>) -> bool {
        match changed {
            Ok(()) => {
                self.dirty = true;
                true
            }
            Err(_) => {
                self.topology_closed = true;
                false
            }
        }
    }

    async fn wait(&mut self) {
        tokio::select! {
            changed = self.topology.changed(), if !self.topology_closed => {
                self.on_topology(changed);
            }
            request = self.requests.recv(), if !self.requests_closed => {
                self.on_request(request);
            }
            else => {
                self.topology_closed = true;
                self.requests_closed = true;
            }
        }
    }

    /// Keeps absorbing triggers until `quiet` has passed.
    async fn settle(&mut self, quiet: Duration) {
        let deadline = tokio::time::sleep(quiet);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                changed = self.topology.changed(), if !self.topology_closed => {
                    self.on_topology(changed);
                }
                request = self.requests.recv(), if !self.requests_closed => {
                    self.on_request(request);
                }
            }
        }
    }
}

struct Halt {
    epoch: Epoch,
    policy: RoutingPolicy,
    reason: String,
}

pub struct ConvergenceDriver {
    engine: PathEngine,
    programmer: FlowProgrammer,
    intake: Intake,
    debounce: Duration,
    /// Epoch and policy whose path computation failed, with the reason.
    halted_at: Option<Halt>,
}

impl ConvergenceDriver {
    pub fn new(
        engine: PathEngine,
        programmer: FlowProgrammer,
        topology: watch::Receiver<Arc<TopologySnapshot>>,
        events: EventBus,
        policy: RoutingPolicy,
        debounce: Duration,
    ) -> (Self, ConvergenceHandle) {
        let (req_tx, req_rx) = mpsc::channel(32);
        let (state_tx, state_rx) =
            watch::channel(ConvergenceState { policy, installed: None, last: None, halted: None });
        let intake = Intake {
            requests: req_rx,
            topology,
            state: state_tx,
            events,
            waiters: Vec::new(),
            policy,
            generation: programmer.generation(),
            force: false,
            // Program whatever is already known at startup.
            dirty: true,
            in_flight: false,
            requests_closed: false,
            topology_closed: false,
        };
        let driver = Self { engine, programmer, intake, debounce, halted_at: None };
        (driver, ConvergenceHandle { requests: req_tx, state: state_rx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(policy = %self.intake.policy, "convergence driver started");
        loop {
            if self.intake.finished() {
                break;
            }
            if !self.intake.has_work() {
                self.intake.wait().await;
                continue;
            }
            if !self.debounce.is_zero() {
                self.intake.settle(self.debounce).await;
            }
            self.run_once().await;
        }
        info!("convergence driver stopped");
    }

    async fn run_once(&mut self) {
        let snapshot = self.intake.topology.borrow_and_update().clone();
        self.intake.dirty = false;
        let force = std::mem::take(&mut self.intake.force);
        let policy = self.intake.policy;
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();

        if let Some(halt) = &self.halted_at {
            if !force && halt.epoch == snapshot.epoch && halt.policy == policy {
                let mut report = ConvergenceReport::empty(self.intake.generation, snapshot.epoch, policy, Outcome::Aborted);
                report.error = Some(halt.reason.clone());
                self.finish(report, None);
                return;
            }
        }

        let table = match self.engine.recompute(&snapshot, policy) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                error!(epoch = %snapshot.epoch, error = %e, "path computation aborted, keeping installed flows");
                let mut report = ConvergenceReport::empty(self.intake.generation, snapshot.epoch, policy, Outcome::Aborted);
                report.error = Some(e.to_string());
                report.started_at = started_at;
                self.halted_at = Some(Halt { epoch: snapshot.epoch, policy, reason: e.to_string() });
                self.finish(report, None);
                return;
            }
        };
        self.halted_at = None;

        let cancel = CancelFlag::new();
        self.intake.in_flight = true;
        let program = {
            let run = self.programmer.converge(&table, &snapshot, ConvergeOptions { force, cancel: &cancel });
            tokio::pin!(run);
            loop {
                tokio::select! {
                    report = &mut run => break report,
                    changed = self.intake.topology.changed(), if !cancel.is_cancelled() && !self.intake.topology_closed => {
                        if self.intake.on_topology(changed) {
                            cancel.cancel();
                        }
                    }
                    request = self.intake.requests.recv(), if !cancel.is_cancelled() && !self.intake.requests_closed => {
                        if self.intake.on_request(request) {
                            cancel.cancel();
                        }
                    }
                }
            }
        };
        self.intake.in_flight = false;

        if program.superseded {
            debug!(generation = program.generation, epoch = %snapshot.epoch, "run superseded, restarting");
            self.intake.force |= force;
            self.intake.generation = program.generation;
            return;
        }

        let mut report = ConvergenceReport::from_program(program, &table);
        report.started_at = started_at;
        report.elapsed_ms = clock.elapsed().as_millis() as u64;
        if report.outcome == Outcome::Degraded {
            warn!(generation = report.generation, failures = report.failures.len(), "convergence degraded");
        }
        self.finish(report, Some(table));
    }

    fn finish(&mut self, report: ConvergenceReport, table: Option<Arc<PathTable>>) {
        self.intake.generation = report.generation;
        if report.outcome != Outcome::Noop {
            self.intake.events.publish(ControllerEvent::Converged {
                generation: report.generation,
                epoch: report.epoch,
                policy: report.policy,
                outcome: report.outcome,
                installed: report.installed,
                removed: report.removed,
                failures: report.failures.len(),
            });
        }
        let halted = self.halted_at.as_ref().map(|halt| halt.reason.clone());
        self.intake.state.send_modify(|s| {
            s.last = Some(report.clone());
            s.halted = halted;
            if let Some(table) = table {
                s.installed = Some(table);
            }
        });
        for waiter in self.intake.waiters.drain(..) {
            let _ = waiter.send(report.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwitchError;
    use crate::models::{Dpid, Endpoint, LinkCapacities, PortNo};
    use crate::switch::{FlowSelector, FlowSpec, PortCounters, SwitchTransport};
    use crate::topology::TopologyStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        installs: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl SwitchTransport for Counting {
        async fn install_flow(&self, _dpid: Dpid, _flow: &FlowSpec) -> Result<(), SwitchError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_flow(&self, _dpid: Dpid, _selector: &FlowSelector) -> Result<(), SwitchError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn port_stats(&self, _dpid: Dpid) -> Result<Vec<PortCounters>, SwitchError> {
            Ok(Vec::new())
        }
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    fn setup() -> (Arc<TopologyStore>, Arc<Counting>, ConvergenceHandle, JoinHandle<()>) {
        let bus = EventBus::new(256);
        let store = Arc::new(TopologyStore::new(LinkCapacities::default(), bus.clone()));
        let transport = Arc::new(Counting::default());
        let programmer = FlowProgrammer::new(transport.clone(), Duration::from_secs(1));
        let (driver, handle) = ConvergenceDriver::new(
            PathEngine::default(),
            programmer,
            store.subscribe(),
            bus,
            RoutingPolicy::HopCount,
            Duration::ZERO,
        );
        let task = driver.spawn();
        (store, transport, handle, task)
    }

    fn build_line(store: &TopologyStore) -> Epoch {
        for d in 1..=3 {
            store.apply_switch_connect(Dpid(d), (1..=3).map(PortNo));
        }
        store.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        store.apply_link_up(Endpoint::new(2, 3), Endpoint::new(3, 2)).unwrap();
        store.apply_host_seen(mac(1), Dpid(1), PortNo(1), None).unwrap();
        store.apply_host_seen(mac(3), Dpid(3), PortNo(1), None).unwrap().epoch
    }

    #[tokio::test]
    async fn topology_changes_drive_convergence() {
        let (store, _t, handle, _task) = setup();
        let epoch = build_line(&store);
        let report = handle.wait_for_epoch(epoch).await.unwrap();
        assert_eq!(report.epoch, epoch);
        assert_eq!(report.routed_pairs, 2);
        let paths = handle.installed_paths().unwrap();
        assert_eq!(paths.epoch, epoch);
    }

    #[tokio::test]
    async fn same_mode_is_a_noop() {
        let (store, transport, handle, _task) = setup();
        let epoch = build_line(&store);
        handle.wait_for_epoch(epoch).await.unwrap();
        let before = transport.installs.load(Ordering::SeqCst);

        let report = handle.request(Trigger::SetMode(RoutingPolicy::HopCount)).await.unwrap();
        assert_eq!(report.outcome, Outcome::Noop);
        assert_eq!(transport.installs.load(Ordering::SeqCst), before);
        assert_eq!(transport.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mode_switch_reconverges() {
        let (store, _t, handle, _task) = setup();
        let epoch = build_line(&store);
        let first = handle.wait_for_epoch(epoch).await.unwrap();

        let report = handle.request(Trigger::SetMode(RoutingPolicy::CostBased)).await.unwrap();
        assert_eq!(report.policy, RoutingPolicy::CostBased);
        assert_eq!(report.outcome, Outcome::Completed);
        assert!(report.generation > first.generation);
        assert_eq!(handle.policy(), RoutingPolicy::CostBased);
        assert_eq!(handle.installed_paths().unwrap().policy, RoutingPolicy::CostBased);
    }

    #[tokio::test]
    async fn reinstall_resends_everything() {
        let (store, transport, handle, _task) = setup();
        let epoch = build_line(&store);
        handle.wait_for_epoch(epoch).await.unwrap();
        let before = transport.installs.load(Ordering::SeqCst);

        let report = handle.request(Trigger::Reinstall).await.unwrap();
        assert_eq!(report.installed, 12);
        assert_eq!(transport.installs.load(Ordering::SeqCst), before + 12);
    }

    #[tokio::test]
    async fn integrity_failure_aborts_and_keeps_flows() {
        let bus = EventBus::new(16);
        let store = TopologyStore::new(LinkCapacities::default(), bus.clone());
        build_line(&store);
        let mut broken = (*store.snapshot()).clone();
        broken.switches.remove(&Dpid(2));
        broken.epoch = Epoch(99);
        let (tx, rx) = watch::channel(Arc::new(broken));

        let transport = Arc::new(Counting::default());
        let programmer = FlowProgrammer::new(transport.clone(), Duration::from_secs(1));
        let (driver, handle) =
            ConvergenceDriver::new(PathEngine::default(), programmer, rx, bus, RoutingPolicy::HopCount, Duration::ZERO);
        let _task = driver.spawn();

        let report = handle.wait_for_epoch(Epoch(99)).await.unwrap();
        assert_eq!(report.outcome, Outcome::Aborted);
        assert!(report.error.is_some());
        assert!(handle.state().halted.is_some());
        assert_eq!(transport.installs.load(Ordering::SeqCst), 0);
        drop(tx);
    }
}
