use crate::error::ConfigError;
use crate::models::{Dpid, LinkCapacities};
use crate::routing::RoutingPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub routing: RoutingConf,
    pub southbound: SouthboundConf,
    pub metrics: MetricsConf,
    pub convergence: ConvergenceConf,
    pub events: EventsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub addr: String,
    /// When unset, every route is open.
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingConf {
    pub policy: RoutingPolicy,
    pub default_bandwidth_mbps: f64,
    pub bandwidth: Vec<BandwidthEntry>,
    pub max_k: usize,
}

/// Capacity of the link(s) between two switches, in either direction.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BandwidthEntry {
    pub a: u64,
    pub b: u64,
    pub mbps: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SouthboundConf {
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConf {
    pub poll_interval_ms: u64,
    pub window_capacity: usize,
    pub retention_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConvergenceConf {
    /// Quiet period after a trigger so discovery bursts share one run.
    pub debounce_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConf {
    pub capacity: usize,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { addr: "0.0.0.0:8080".into(), api_key: None }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "netweb-controller".into(),
            keep_alive_secs: 30,
        }
    }
}

impl Default for RoutingConf {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::HopCount,
            default_bandwidth_mbps: 10.0,
            bandwidth: Vec::new(),
            max_k: 10,
        }
    }
}

impl Default for SouthboundConf {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self { poll_interval_ms: 1000, window_capacity: 64, retention_secs: 60 }
    }
}

impl Default for ConvergenceConf {
    fn default() -> Self {
        Self { debounce_ms: 50 }
    }
}

impl Default for EventsConf {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl RoutingConf {
    pub fn capacities(&self) -> LinkCapacities {
        let mut caps = LinkCapacities::new(self.default_bandwidth_mbps);
        for entry in &self.bandwidth {
            caps.insert(Dpid(entry.a), Dpid(entry.b), entry.mbps);
        }
        caps
    }
}

impl SouthboundConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MetricsConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl ConvergenceConf {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl ControllerConfig {
    /// Rejects values that would stall a loop or divide by zero later on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.southbound.timeout_ms == 0 {
            return Err(ConfigError::invalid("southbound.timeout_ms", "must be > 0"));
        }
        if self.metrics.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("metrics.poll_interval_ms", "must be > 0"));
        }
        if self.metrics.window_capacity < 2 {
            return Err(ConfigError::invalid("metrics.window_capacity", "must hold at least 2 samples"));
        }
        if self.metrics.retention_secs == 0 {
            return Err(ConfigError::invalid("metrics.retention_secs", "must be > 0"));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::invalid("events.capacity", "must be > 0"));
        }
        if self.routing.max_k == 0 {
            return Err(ConfigError::invalid("routing.max_k", "must be > 0"));
        }
        if !(self.routing.default_bandwidth_mbps > 0.0) {
            return Err(ConfigError::invalid("routing.default_bandwidth_mbps", "must be positive"));
        }
        for entry in &self.routing.bandwidth {
            if !(entry.mbps > 0.0) {
                return Err(ConfigError::invalid(
                    "routing.bandwidth",
                    format!("s{}-s{} has non-positive bandwidth {}", entry.a, entry.b, entry.mbps),
                ));
            }
        }
        Ok(())
    }

    /// Environment wins over the file for deployment-specific knobs.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("NETWEB_HTTP_ADDR") {
            self.http.addr = addr;
        }
        if let Ok(key) = std::env::var("NETWEB_API_KEY") {
            self.http.api_key = if key.is_empty() { None } else { Some(key) };
        }
        if let Ok(host) = std::env::var("NETWEB_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("NETWEB_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| ConfigError::invalid("NETWEB_MQTT_PORT", format!("not a port: {port}")))?;
        }
        if let Ok(ms) = std::env::var("NETWEB_POLL_INTERVAL_MS") {
            self.metrics.poll_interval_ms = ms
                .parse()
                .map_err(|_| ConfigError::invalid("NETWEB_POLL_INTERVAL_MS", format!("not a number: {ms}")))?;
        }
        Ok(())
    }
}

/// Reads `path`, falling back to defaults when the file is absent or blank.
pub async fn load_config_from(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let shown = path.display().to_string();
    if !path.exists() {
        warn!(path = %shown, "no controller config found, using defaults");
        return Ok(ControllerConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: shown.clone(), source })?;
    if txt.trim().is_empty() {
        warn!(path = %shown, "controller config is empty, using defaults");
        return Ok(ControllerConfig::default());
    }
    let cfg: ControllerConfig =
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml { path: shown, source })?;
    Ok(cfg)
}

pub async fn load_config() -> Result<ControllerConfig, ConfigError> {
    let path = std::env::var("NETWEB_CONTROLLER_CONFIG").unwrap_or_else(|_| "controller.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.yaml")).await.unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.routing.policy, RoutingPolicy::HopCount);
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn blank_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();
        let cfg = load_config_from(file.path()).await.unwrap();
        assert_eq!(cfg.metrics.poll_interval_ms, 1000);
    }

    #[tokio::test]
    async fn partial_yaml_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "routing:\n  policy: distrak\n  bandwidth:\n    - {{a: 1, b: 2, mbps: 100}}\nmetrics:\n  poll_interval_ms: 250\n"
        )
        .unwrap();
        let cfg = load_config_from(file.path()).await.unwrap();
        assert_eq!(cfg.routing.policy, RoutingPolicy::CostBased);
        assert_eq!(cfg.metrics.poll_interval_ms, 250);
        assert_eq!(cfg.metrics.window_capacity, 64);
        assert_eq!(cfg.routing.capacities().lookup(Dpid(2), Dpid(1)), 100.0);
        assert_eq!(cfg.routing.capacities().lookup(Dpid(2), Dpid(3)), 10.0);
    }

    #[tokio::test]
    async fn broken_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "routing: [not, a, map").unwrap();
        let err = load_config_from(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn validate_rejects_zero_interval_and_bad_bandwidth() {
        let mut cfg = ControllerConfig::default();
        cfg.metrics.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ControllerConfig::default();
        cfg.routing.bandwidth.push(BandwidthEntry { a: 1, b: 2, mbps: 0.0 });
        assert!(cfg.validate().is_err());
    }
}
