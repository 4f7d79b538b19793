/**
 * REST API - Northbound HTTP interface of the controller
 *
 * ROLE:
 * Operators and dashboards read topology, paths and metrics here, switch
 * the routing mode and force reinstalls.
 *
 * OPERATION:
 * - Axum router over `ControlApi`; every handler is a thin adapter
 * - mode changes and reinstalls answer once the fabric has converged, with
 *   the convergence report as body
 * - `/events` streams controller events as Server-Sent Events
 *
 * SECURITY:
 * - when an API key is configured, header x-api-key is required on every
 *   route except /health*
 */

use crate::control::ControlApi;
use crate::convergence::ConvergenceReport;
use crate::error::{ControlError, RoutingError};
use crate::events::EventBus;
use crate::health::{ControllerHealth, HealthTracker};
use crate::metrics::{LinkReport, MetricsSnapshot, PathMetrics};
use crate::models::{Dpid, MacAddr};
use crate::routing::{PathEntry, RoutingPolicy, SwitchPath};
use crate::topology::TopologyView;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub control: ControlApi,
    pub health: HealthTracker,
    pub events: EventBus,
    pub api_key: Option<String>,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::Policy(_) => StatusCode::BAD_REQUEST,
            ControlError::Routing(RoutingError::InvalidK { .. }) => StatusCode::BAD_REQUEST,
            ControlError::Routing(RoutingError::UnknownSwitch(_)) => StatusCode::NOT_FOUND,
            ControlError::Routing(_) => StatusCode::CONFLICT,
            ControlError::UnknownLink(..) | ControlError::UnknownHost(_) | ControlError::NoInstalledPath(..) => {
                StatusCode::NOT_FOUND
            }
            ControlError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(get_health))
        .route("/mode", get(get_mode).post(set_mode))
        .route("/reinstall", post(reinstall))
        .route("/topology", get(get_topology))
        .route("/convergence", get(get_convergence))
        .route("/paths", get(get_paths))
        .route("/path", get(get_k_shortest))
        .route("/metrics", get(get_metrics))
        .route("/metrics/link", get(get_link_metrics))
        .route("/metrics/path", get(get_path_metrics))
        .route("/events", get(stream_events))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /healthz
async fn get_health(State(app): State<AppState>) -> Json<ControllerHealth> {
    Json(app.health.get_health(&app.control))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

#[derive(Debug, Serialize)]
struct ModeView {
    mode: RoutingPolicy,
}

// GET /mode
async fn get_mode(State(app): State<AppState>) -> Json<ModeView> {
    Json(ModeView { mode: app.control.get_mode() })
}

// POST /mode {"mode": "cost_based"}
async fn set_mode(
    State(app): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<Json<ConvergenceReport>, ControlError> {
    Ok(Json(app.control.set_mode_named(&body.mode).await?))
}

// POST /reinstall
async fn reinstall(State(app): State<AppState>) -> Result<Json<ConvergenceReport>, ControlError> {
    Ok(Json(app.control.force_reinstall().await?))
}

// GET /topology
async fn get_topology(State(app): State<AppState>) -> Json<TopologyView> {
    Json(app.control.get_topology_snapshot().view())
}

#[derive(Debug, Serialize)]
struct ConvergenceView {
    policy: RoutingPolicy,
    halted: Option<String>,
    last: Option<ConvergenceReport>,
}

// GET /convergence
async fn get_convergence(State(app): State<AppState>) -> Json<ConvergenceView> {
    let state = app.control.convergence_state();
    Json(ConvergenceView { policy: state.policy, halted: state.halted, last: state.last })
}

// GET /paths (installed path table)
async fn get_paths(State(app): State<AppState>) -> Response {
    match app.control.installed_paths() {
        Some(table) => {
            let entries: Vec<PathEntry<'_>> = table.entries();
            Json(serde_json::json!({
                "epoch": table.epoch,
                "policy": table.policy,
                "routes": entries,
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "no path table installed yet" })))
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct KShortestParams {
    src: u64,
    dst: u64,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    1
}

// GET /path?src=1&dst=3&k=2
async fn get_k_shortest(
    State(app): State<AppState>,
    Query(params): Query<KShortestParams>,
) -> Result<Json<Vec<SwitchPath>>, ControlError> {
    Ok(Json(app.control.k_shortest_paths(Dpid(params.src), Dpid(params.dst), params.k)?))
}

// GET /metrics
async fn get_metrics(State(app): State<AppState>) -> Json<MetricsSnapshot> {
    Json(app.control.get_metrics_snapshot())
}

#[derive(Debug, Deserialize)]
struct LinkParams {
    u: u64,
    v: u64,
}

// GET /metrics/link?u=1&v=2
async fn get_link_metrics(
    State(app): State<AppState>,
    Query(params): Query<LinkParams>,
) -> Result<Json<LinkReport>, ControlError> {
    Ok(Json(app.control.link_metrics(Dpid(params.u), Dpid(params.v))?))
}

#[derive(Debug, Deserialize)]
struct PathParams {
    src: MacAddr,
    dst: MacAddr,
}

// GET /metrics/path?src=00:00:00:00:00:01&dst=00:00:00:00:00:02
async fn get_path_metrics(
    State(app): State<AppState>,
    Query(params): Query<PathParams>,
) -> Result<Json<PathMetrics>, ControlError> {
    Ok(Json(app.control.path_metrics(params.src, params.dst)?))
}

// GET /events (SSE)
async fn stream_events(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = app.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default().event(event.kind()).json_data(&event);
                    return Some((sse, rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
