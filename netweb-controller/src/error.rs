//! Error taxonomy of the controller.
//!
//! Local failures (one switch, one pair) are values collected into reports;
//! only integrity failures stop a convergence.

use crate::models::{Dpid, Epoch, LinkId, MacAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopologyError {
    #[error("unknown switch {0}")]
    UnknownSwitch(Dpid),
    #[error("switch {0} is disconnected")]
    SwitchDisconnected(Dpid),
    #[error("link {0} loops back onto its own switch")]
    SelfLoop(LinkId),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoutingError {
    /// The snapshot references something it does not contain. Convergence
    /// aborts and installed state is left untouched.
    #[error("data integrity violation at epoch {epoch}: {detail}")]
    DataIntegrity { epoch: Epoch, detail: String },
    #[error("link {link} has unusable weight {weight}")]
    InvalidWeight { link: LinkId, weight: f64 },
    #[error("unknown switch {0}")]
    UnknownSwitch(Dpid),
    #[error("k must be between 1 and {max}, got {k}")]
    InvalidK { k: usize, max: usize },
}

/// Per-switch southbound failure. Isolated to the switch and retried on the
/// next convergence or sampling cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SwitchError {
    #[error("switch {dpid} did not answer within {timeout:?}")]
    Timeout { dpid: Dpid, timeout: Duration },
    #[error("switch {0} is unreachable")]
    Unreachable(Dpid),
    #[error("switch {dpid} rejected request: {reason}")]
    Rejected { dpid: Dpid, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("unknown routing policy '{0}' (expected hop_count or cost_based)")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field: field.to_string(), reason: reason.into() }
    }
}

/// Errors surfaced by the control API.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("no link between {0} and {1}")]
    UnknownLink(Dpid, Dpid),
    #[error("unknown host {0}")]
    UnknownHost(MacAddr),
    #[error("no installed path from {0} to {1}")]
    NoInstalledPath(MacAddr, MacAddr),
    #[error("convergence driver has stopped")]
    Unavailable,
}
