//! Wiring of the long-lived components.
//!
//! `Controller::start` builds the store, discovery adapter, convergence
//! driver and metrics collector around one southbound transport. The binary
//! passes the MQTT bridge; tests pass the devkit fabric.

use crate::config::ControllerConfig;
use crate::control::ControlApi;
use crate::convergence::ConvergenceDriver;
use crate::discovery::DiscoveryAdapter;
use crate::events::EventBus;
use crate::flows::FlowProgrammer;
use crate::metrics::MetricsCollector;
use crate::routing::{InverseBandwidth, LinkWeight, PathEngine};
use crate::switch::SwitchTransport;
use crate::topology::TopologyStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct ControllerOptions {
    /// Weight of the cost-based policy.
    pub weight: Arc<dyn LinkWeight>,
    /// Start the periodic metrics poll. Tests drive `sample_once` by hand.
    pub poll_metrics: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { weight: Arc::new(InverseBandwidth), poll_metrics: true }
    }
}

pub struct Controller {
    pub store: Arc<TopologyStore>,
    pub discovery: DiscoveryAdapter,
    pub control: ControlApi,
    pub metrics: Arc<MetricsCollector>,
    pub events: EventBus,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    pub fn start(config: &ControllerConfig, transport: Arc<dyn SwitchTransport>, options: ControllerOptions) -> Self {
        let events = EventBus::new(config.events.capacity);
        let store = Arc::new(TopologyStore::new(config.routing.capacities(), events.clone()));
        let engine = PathEngine::new(options.weight);
        let timeout = config.southbound.timeout();

        let programmer = FlowProgrammer::new(transport.clone(), timeout);
        let (driver, handle) = ConvergenceDriver::new(
            engine.clone(),
            programmer,
            store.subscribe(),
            events.clone(),
            config.routing.policy,
            config.convergence.debounce(),
        );
        let mut tasks = vec![driver.spawn()];

        let metrics = Arc::new(MetricsCollector::new(transport, store.clone(), config.metrics.clone(), timeout));
        if options.poll_metrics {
            tasks.push(metrics.clone().spawn());
        }

        let control = ControlApi::new(store.clone(), handle, metrics.clone(), engine, config.routing.max_k);
        info!(policy = %config.routing.policy, "controller started");

        Self { discovery: DiscoveryAdapter::new(store.clone()), store, control, metrics, events, tasks }
    }

    /// Attaches an auxiliary task so it is stopped with the controller.
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("controller stopped");
    }
}
