/*!
Test harness: a running controller on top of a `FakeFabric`.

Topology helpers update both sides at once (the cable in the fabric and the
discovery event to the controller) so scenarios read like a lab script.
*/

use crate::builders::{host_ip, host_mac, DiscoveryMessageBuilder as Msg};
use crate::fabric::FakeFabric;
use anyhow::{Context, Result};
use netweb_controller::config::ControllerConfig;
use netweb_controller::convergence::ConvergenceReport;
use netweb_controller::discovery::DiscoveryEvent;
use netweb_controller::health::HealthTracker;
use netweb_controller::http::{build_router, AppState};
use netweb_controller::models::{Endpoint, Epoch, MacAddr};
use netweb_controller::routing::{InverseBandwidth, LinkWeight};
use netweb_controller::runtime::{Controller, ControllerOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::info;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub fabric: Arc<FakeFabric>,
    pub controller: Controller,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    /// Fast timeouts, no debounce, metrics polled by hand.
    pub fn test_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.southbound.timeout_ms = 200;
        config.convergence.debounce_ms = 0;
        config
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::with_weight(config, Arc::new(InverseBandwidth))
    }

    pub fn with_weight(config: ControllerConfig, weight: Arc<dyn LinkWeight>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let fabric = Arc::new(FakeFabric::new());
        let controller = Controller::start(&config, fabric.clone(), ControllerOptions { weight, poll_metrics: false });
        Self { fabric, controller }
    }

    pub fn emit(&self, event: DiscoveryEvent) -> Result<Epoch> {
        let applied = self.controller.discovery.apply(event).context("discovery event rejected")?;
        Ok(applied.epoch)
    }

    pub fn add_switch(&self, dpid: u64, ports: impl IntoIterator<Item = u32>) -> Result<Epoch> {
        self.emit(Msg::switch_connected(dpid, ports))
    }

    pub fn remove_switch(&self, dpid: u64) -> Result<Epoch> {
        self.fabric.wipe(netweb_controller::models::Dpid(dpid));
        self.emit(Msg::switch_disconnected(dpid))
    }

    pub fn connect(&self, a: (u64, u32), b: (u64, u32)) -> Result<Epoch> {
        self.fabric.wire(Endpoint::new(a.0, a.1), Endpoint::new(b.0, b.1));
        self.emit(Msg::link_discovered(a, b))
    }

    pub fn cut(&self, a: (u64, u32), b: (u64, u32)) -> Result<Epoch> {
        self.fabric.unwire(Endpoint::new(a.0, a.1), Endpoint::new(b.0, b.1));
        self.emit(Msg::link_lost(a, b))
    }

    /// Host `n` gets MAC `..:0n` and IP `10.0.0.n`.
    pub fn attach_host(&self, n: u8, at: (u64, u32)) -> Result<MacAddr> {
        let mac = host_mac(n);
        self.fabric.attach_host(mac, Some(host_ip(n)), Endpoint::new(at.0, at.1));
        self.emit(Msg::host_observed(mac, at, Some(host_ip(n))))?;
        Ok(mac)
    }

    /// Switches 1..=n in a chain (port 2 east, port 3 west), host 1 on
    /// s1 port 1 and host 2 on sn port 1.
    pub fn line(&self, n: u64) -> Result<(MacAddr, MacAddr)> {
        for dpid in 1..=n {
            self.add_switch(dpid, [1, 2, 3])?;
        }
        for dpid in 1..n {
            self.connect((dpid, 2), (dpid + 1, 3))?;
        }
        let h1 = self.attach_host(1, (1, 1))?;
        let h2 = self.attach_host(2, (n, 1))?;
        Ok((h1, h2))
    }

    /// Waits until the fabric has been programmed for the current epoch.
    pub async fn settle(&self) -> Result<ConvergenceReport> {
        let epoch = self.controller.store.epoch();
        let report = timeout(SETTLE_TIMEOUT, self.controller.control.converged(epoch))
            .await
            .with_context(|| format!("no convergence for epoch {epoch} within {SETTLE_TIMEOUT:?}"))??;
        info!(epoch = %report.epoch, outcome = ?report.outcome, "settled");
        Ok(report)
    }

    /// Serves the REST API on an ephemeral local port.
    pub async fn serve_http(&self, api_key: Option<&str>) -> Result<SocketAddr> {
        let app = build_router(AppState {
            control: self.controller.control.clone(),
            health: HealthTracker::new(),
            events: self.controller.events.clone(),
            api_key: api_key.map(str::to_string),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(addr)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
