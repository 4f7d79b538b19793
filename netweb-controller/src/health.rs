use crate::control::ControlApi;
use crate::convergence::Outcome;
use crate::routing::RoutingPolicy;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "netweb/controller/health@v1";

#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub uptime_seconds: u64,
    pub epoch: u64,
    pub switches_connected: u32,
    pub links: u32,
    pub hosts: u32,
    pub mode: RoutingPolicy,
    pub last_outcome: Option<Outcome>,
    pub converged_epoch: Option<u64>,
    pub halted: Option<String>,
    /// Seconds since the last completed metrics poll.
    pub metrics_age_seconds: Option<i64>,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, control: &ControlApi) -> ControllerHealth {
        let topology = control.get_topology_snapshot();
        let state = control.convergence_state();
        let metrics_age_seconds = control
            .get_metrics_snapshot()
            .sampled_at
            .map(|at| (OffsetDateTime::now_utc() - at).whole_seconds());

        ControllerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            epoch: topology.epoch.0,
            switches_connected: topology.connected_switches().len() as u32,
            links: topology.links.len() as u32,
            hosts: topology.hosts.len() as u32,
            mode: state.policy,
            last_outcome: state.last.as_ref().map(|r| r.outcome),
            converged_epoch: state.last.as_ref().map(|r| r.epoch.0),
            halted: state.halted,
            metrics_age_seconds,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publishes the health report every `every` on the shared client.
    pub fn spawn_health_publisher(&self, client: AsyncClient, control: ControlApi, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&control);
                let payload = match serde_json::to_vec(&health) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "cannot serialize health report");
                        continue;
                    }
                };
                match client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => debug!(uptime = health.uptime_seconds, epoch = health.epoch, "published health"),
                    Err(e) => warn!(error = ?e, "failed to publish health"),
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mqtt_status_transitions() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.mqtt_status(), "connecting");
        tracker.mark_mqtt_connected();
        assert_eq!(tracker.mqtt_status(), "connected");
        tracker.increment_reconnects();
        tracker.increment_reconnects();
        assert_eq!(tracker.mqtt_status(), "reconnecting");
        assert_eq!(tracker.mqtt_reconnects.load(Ordering::Relaxed), 2);
        tracker.mark_mqtt_disconnected();
        assert_eq!(tracker.mqtt_status(), "disconnected");
    }
}
