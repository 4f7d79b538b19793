/**
 * SWITCH BRIDGE - SwitchTransport over MQTT request/response
 *
 * ROLE:
 * Talks to the switch agent runtime, which owns the OpenFlow sessions.
 * Every call becomes one command on `netweb/switch/command@v1/<dpid>` and
 * waits for the matching reply on `netweb/switch/response@v1`.
 *
 * OPERATION:
 * - each command carries a fresh request_id; a oneshot sender is parked in
 *   the pending map under that id
 * - the MQTT loop hands every response payload to `handle_response`, which
 *   wakes the waiting caller
 * - no reply within the timeout: the pending entry is dropped and the call
 *   fails with `SwitchError::Timeout`; a caller that gives up earlier (its
 *   future dropped) takes its entry with it
 */

use crate::error::SwitchError;
use crate::models::Dpid;
use crate::state::{new_state, Shared};
use crate::switch::{FlowSelector, FlowSpec, PortCounters, SwitchTransport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

pub const COMMAND_TOPIC_PREFIX: &str = "netweb/switch/command@v1";
pub const RESPONSE_TOPIC: &str = "netweb/switch/response@v1";

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SwitchCommand<'a> {
    InstallFlow { request_id: String, dpid: Dpid, flow: &'a FlowSpec },
    DeleteFlow { request_id: String, dpid: Dpid, selector: &'a FlowSelector },
    PortStats { request_id: String, dpid: Dpid },
}

impl SwitchCommand<'_> {
    fn request_id(&self) -> &str {
        match self {
            SwitchCommand::InstallFlow { request_id, .. }
            | SwitchCommand::DeleteFlow { request_id, .. }
            | SwitchCommand::PortStats { request_id, .. } => request_id,
        }
    }

    fn dpid(&self) -> Dpid {
        match self {
            SwitchCommand::InstallFlow { dpid, .. }
            | SwitchCommand::DeleteFlow { dpid, .. }
            | SwitchCommand::PortStats { dpid, .. } => *dpid,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchResponse {
    Success {
        request_id: String,
        #[serde(default)]
        ports: Vec<PortCounters>,
    },
    Error {
        request_id: String,
        error: String,
    },
    /// The agent has no live session with the switch.
    Unreachable {
        request_id: String,
    },
}

impl SwitchResponse {
    fn request_id(&self) -> &str {
        match self {
            SwitchResponse::Success { request_id, .. }
            | SwitchResponse::Error { request_id, .. }
            | SwitchResponse::Unreachable { request_id } => request_id,
        }
    }
}

type PendingMap = Shared<HashMap<String, oneshot::Sender<SwitchResponse>>>;

/// Removes a parked request when its caller finishes or goes away.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

pub struct MqttSwitchBridge {
    client: AsyncClient,
    pending: PendingMap,
    timeout: Duration,
}

impl MqttSwitchBridge {
    pub fn new(client: AsyncClient, timeout: Duration) -> Self {
        Self { client, pending: new_state(HashMap::new()), timeout }
    }

    /// Called by the MQTT loop for every payload on the response topic.
    pub fn handle_response(&self, payload: &[u8]) {
        let response: SwitchResponse = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "invalid switch response payload");
                return;
            }
        };
        let id = response.request_id().to_string();
        match self.pending.lock().remove(&id) {
            Some(sender) => {
                // The caller may have timed out in between.
                let _ = sender.send(response);
            }
            None => debug!(request_id = %id, "response for unknown or expired request"),
        }
    }

    pub fn pending_requests(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    async fn exchange(&self, command: SwitchCommand<'_>) -> Result<SwitchResponse, SwitchError> {
        let dpid = command.dpid();
        let request_id = command.request_id().to_string();
        let payload = serde_json::to_vec(&command).map_err(|e| SwitchError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard { pending: &self.pending, request_id };

        let topic = format!("{COMMAND_TOPIC_PREFIX}/{}", dpid.0);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| SwitchError::Transport(e.to_string()))?;

        let response = match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(SwitchError::Transport("response channel closed".into())),
            Err(_) => return Err(SwitchError::Timeout { dpid, timeout: self.timeout }),
        };
        match response {
            SwitchResponse::Error { error, .. } => Err(SwitchError::Rejected { dpid, reason: error }),
            SwitchResponse::Unreachable { .. } => Err(SwitchError::Unreachable(dpid)),
            ok => Ok(ok),
        }
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl SwitchTransport for MqttSwitchBridge {
    async fn install_flow(&self, dpid: Dpid, flow: &FlowSpec) -> Result<(), SwitchError> {
        self.exchange(SwitchCommand::InstallFlow { request_id: new_request_id(), dpid, flow }).await.map(|_| ())
    }

    async fn delete_flow(&self, dpid: Dpid, selector: &FlowSelector) -> Result<(), SwitchError> {
        self.exchange(SwitchCommand::DeleteFlow { request_id: new_request_id(), dpid, selector }).await.map(|_| ())
    }

    async fn port_stats(&self, dpid: Dpid) -> Result<Vec<PortCounters>, SwitchError> {
        match self.exchange(SwitchCommand::PortStats { request_id: new_request_id(), dpid }).await? {
            SwitchResponse::Success { ports, .. } => Ok(ports),
            _ => Err(SwitchError::Transport("unexpected response kind".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortNo;
    use crate::switch::{FlowAction, FlowMatch};
    use rumqttc::MqttOptions;
    use std::sync::Arc;

    fn bridge(timeout: Duration) -> (Arc<MqttSwitchBridge>, rumqttc::EventLoop) {
        // The event loop is never polled: publishes just queue up.
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("bridge-test", "localhost", 1883), 16);
        (Arc::new(MqttSwitchBridge::new(client, timeout)), eventloop)
    }

    async fn wait_for_pending(bridge: &MqttSwitchBridge) -> String {
        loop {
            if let Some(id) = bridge.pending_requests().into_iter().next() {
                return id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn response_completes_the_matching_request() {
        let (bridge, _eventloop) = bridge(Duration::from_secs(5));
        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.port_stats(Dpid(3)).await })
        };
        let id = wait_for_pending(&bridge).await;
        let reply = serde_json::json!({
            "type": "success",
            "request_id": id,
            "ports": [{"port": 1, "tx_bytes": 10, "rx_bytes": 20, "tx_packets": 1, "rx_packets": 2}]
        });
        bridge.handle_response(reply.to_string().as_bytes());

        let ports = caller.await.unwrap().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, PortNo(1));
        assert!(bridge.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn error_replies_map_to_switch_errors() {
        let (bridge, _eventloop) = bridge(Duration::from_secs(5));
        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.port_stats(Dpid(8)).await })
        };
        let id = wait_for_pending(&bridge).await;
        bridge.handle_response(serde_json::json!({"type": "unreachable", "request_id": id}).to_string().as_bytes());
        assert_eq!(caller.await.unwrap().unwrap_err(), SwitchError::Unreachable(Dpid(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_cleans_up() {
        let (bridge, _eventloop) = bridge(Duration::from_millis(300));
        let err = bridge.port_stats(Dpid(2)).await.unwrap_err();
        assert!(matches!(err, SwitchError::Timeout { dpid: Dpid(2), .. }));
        assert!(bridge.pending_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_leaves_nothing_pending() {
        let (bridge, _eventloop) = bridge(Duration::from_secs(30));
        let flow = FlowSpec { matches: FlowMatch::Any, action: FlowAction::Drop, priority: 0, cookie: 1 };
        let outer = tokio::time::timeout(Duration::from_millis(50), bridge.install_flow(Dpid(5), &flow)).await;
        assert!(outer.is_err());
        assert!(bridge.pending_requests().is_empty());
    }

    #[test]
    fn garbage_responses_are_ignored() {
        let (bridge, _eventloop) = bridge(Duration::from_secs(1));
        bridge.handle_response(b"not json");
        bridge.handle_response(br#"{"type":"success","request_id":"nobody"}"#);
    }
}
