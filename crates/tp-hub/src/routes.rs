use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tp_core::{
    fleet_view, FleetError, FleetView, HealthState, Node, Nudge, NudgePriority, NudgeStats,
    RateLimitPolicy, SignalChannel,
};
use tp_storage::{FleetStore, NewNode, StoreError};
use tracing::{error, info, warn};

use crate::auth::{bearer_token, AdminKeyring};

pub struct AppState {
    pub store: FleetStore,
    pub keyring: AdminKeyring,
    pub policy: RateLimitPolicy,
}

pub type SharedState = Arc<AppState>;

type ErrorResponse = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

fn error_body(status: StatusCode, code: &'static str, message: impl Into<String>) -> ErrorResponse {
    (
        status,
        Json(ErrorBody {
            code,
            message: message.into(),
        }),
    )
}

/// Admin clients poll `GET /fleet` for the dashboard; facilitator clients
/// poll their pending mailbox. The hub enforces no cadence.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fleet", get(get_fleet))
        .route("/nudges", post(create_nudge))
        .route("/sessions/:session_id/broadcast", post(broadcast))
        .route("/nodes", post(join_node))
        .route("/nodes/:node_id/complete", post(complete_node))
        .route("/nodes/:node_id/seen/:channel", post(channel_seen))
        .route("/nodes/:node_id/nudges/pending", get(poll_pending))
        .route("/nodes/:node_id/nudge-stats", get(nudge_stats))
        .route("/nudges/:nudge_id/open", post(open_nudge))
        .route("/nudges/:nudge_id/ack", post(acknowledge))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct FleetParams {
    #[serde(default)]
    filter: String,
    #[serde(default)]
    health: Option<String>,
}

async fn get_fleet(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<FleetParams>,
) -> Result<Json<FleetView>, ErrorResponse> {
    require_admin(&state, &headers)?;
    let health_filter = parse_health_filter(params.health.as_deref())
        .map_err(|msg| error_body(StatusCode::BAD_REQUEST, "invalid_health_filter", msg))?;
    let nodes = state.store.list_active().map_err(store_error)?;
    Ok(Json(fleet_view(
        &nodes,
        &params.filter,
        health_filter,
        Utc::now(),
    )))
}

#[derive(Debug, Deserialize)]
struct CreateNudgeRequest {
    node_id: i64,
    message: String,
    #[serde(default)]
    priority: NudgePriority,
}

async fn create_nudge(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateNudgeRequest>,
) -> Result<(StatusCode, Json<Nudge>), ErrorResponse> {
    require_admin(&state, &headers)?;
    let nudge = state
        .store
        .create_nudge(
            req.node_id,
            &req.message,
            req.priority,
            &state.policy,
            Utc::now(),
        )
        .map_err(store_error)?;
    info!(
        event = "nudge_created",
        nudge_id = nudge.nudge_id,
        node_id = nudge.node_id,
        priority = %nudge.priority
    );
    Ok((StatusCode::CREATED, Json(nudge)))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: String,
    #[serde(default)]
    priority: NudgePriority,
}

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    sent: usize,
    skipped: Vec<i64>,
    nudges: Vec<Nudge>,
}

async fn broadcast(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ErrorResponse> {
    require_admin(&state, &headers)?;
    let outcome = state
        .store
        .broadcast(
            session_id,
            &req.message,
            req.priority,
            &state.policy,
            Utc::now(),
        )
        .map_err(store_error)?;
    info!(
        event = "broadcast_sent",
        session_id,
        sent = outcome.sent.len(),
        skipped = outcome.skipped.len()
    );
    Ok(Json(BroadcastResponse {
        sent: outcome.sent.len(),
        skipped: outcome.skipped,
        nudges: outcome.sent,
    }))
}

async fn nudge_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(node_id): Path<i64>,
) -> Result<Json<NudgeStats>, ErrorResponse> {
    require_admin(&state, &headers)?;
    let stats = state.store.nudge_stats(node_id).map_err(store_error)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    node_id: i64,
    session_id: i64,
    session_name: String,
    event_name: String,
    #[serde(default)]
    topic: String,
}

async fn join_node(
    State(state): State<SharedState>,
    Json(req): Json<JoinRequest>,
) -> Result<(StatusCode, Json<Node>), ErrorResponse> {
    if state.store.get_node(req.node_id).is_ok() {
        return Err(error_body(
            StatusCode::CONFLICT,
            "already_joined",
            format!("node {} is already registered", req.node_id),
        ));
    }
    let node = state
        .store
        .register_node(&NewNode {
            node_id: req.node_id,
            session_id: req.session_id,
            session_name: req.session_name,
            event_name: req.event_name,
            topic: req.topic,
        })
        .map_err(store_error)?;
    info!(
        event = "node_joined",
        node_id = node.node_id,
        session_id = node.session_id,
        join_code = %node.join_code
    );
    Ok((StatusCode::CREATED, Json(node)))
}

async fn complete_node(
    State(state): State<SharedState>,
    Path(node_id): Path<i64>,
) -> Result<StatusCode, ErrorResponse> {
    state.store.complete_node(node_id).map_err(store_error)?;
    info!(event = "node_completed", node_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Stale writes (completed node, out-of-order instant) are ordinary races
/// with session teardown; log them and answer 202.
async fn channel_seen(
    State(state): State<SharedState>,
    Path((node_id, channel)): Path<(i64, String)>,
) -> Result<StatusCode, ErrorResponse> {
    let channel = SignalChannel::from_str(&channel)
        .map_err(|msg| error_body(StatusCode::BAD_REQUEST, "invalid_channel", msg))?;
    match state.store.upsert_last_seen(node_id, channel, Utc::now()) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(err) => match err.as_fleet() {
            Some(FleetError::StaleWriteRejected(reason)) => {
                warn!(event = "stale_write_dropped", node_id, channel = %channel, reason = %reason);
                Ok(StatusCode::ACCEPTED)
            }
            _ => Err(store_error(err)),
        },
    }
}

async fn poll_pending(
    State(state): State<SharedState>,
    Path(node_id): Path<i64>,
) -> Result<Json<Vec<Nudge>>, ErrorResponse> {
    let pending = state
        .store
        .poll_pending(node_id, Utc::now())
        .map_err(store_error)?;
    Ok(Json(pending))
}

#[derive(Debug, Deserialize)]
struct RecipientRequest {
    node_id: i64,
}

async fn open_nudge(
    State(state): State<SharedState>,
    Path(nudge_id): Path<i64>,
    Json(req): Json<RecipientRequest>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .store
        .mark_opened(nudge_id, req.node_id, Utc::now())
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn acknowledge(
    State(state): State<SharedState>,
    Path(nudge_id): Path<i64>,
    Json(req): Json<RecipientRequest>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .store
        .acknowledge(nudge_id, req.node_id, Utc::now())
        .map_err(store_error)?;
    info!(event = "nudge_acknowledged", nudge_id, node_id = req.node_id);
    Ok(StatusCode::NO_CONTENT)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ErrorResponse> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    match token {
        Some(token) if state.keyring.accept(token, Utc::now()) => Ok(()),
        _ => Err(error_body(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or expired admin token",
        )),
    }
}

/// `"all"`, empty or absent means no health filtering.
fn parse_health_filter(raw: Option<&str>) -> Result<Option<HealthState>, String> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) if value.trim().eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => HealthState::from_str(value).map(Some),
    }
}

/// Maps domain failures onto distinguishable statuses.
fn store_error(err: StoreError) -> ErrorResponse {
    match err.as_fleet() {
        Some(FleetError::Validation(msg)) => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", msg.clone())
        }
        Some(FleetError::RateLimited { node_id, count }) => error_body(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!("node {node_id} already has {count} nudges in the current window"),
        ),
        Some(FleetError::NotFound(what)) => {
            error_body(StatusCode::NOT_FOUND, "not_found", what.clone())
        }
        Some(FleetError::StaleWriteRejected(reason)) => {
            error_body(StatusCode::ACCEPTED, "stale_write_dropped", reason.clone())
        }
        None => {
            error!(event = "storage_error", error = %err);
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "internal storage failure",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_filter_treats_all_and_empty_as_no_filter() {
        assert_eq!(parse_health_filter(None).expect("none"), None);
        assert_eq!(parse_health_filter(Some("")).expect("empty"), None);
        assert_eq!(parse_health_filter(Some("all")).expect("all"), None);
        assert_eq!(parse_health_filter(Some("ALL")).expect("ALL"), None);
        assert_eq!(
            parse_health_filter(Some("degraded")).expect("degraded"),
            Some(HealthState::Degraded)
        );
        assert!(parse_health_filter(Some("sideways")).is_err());
    }

    #[test]
    fn domain_errors_map_to_distinguishable_statuses() {
        let (status, Json(body)) =
            store_error(FleetError::Validation("empty message".to_string()).into());
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.code, "validation_failed");

        let (status, Json(body)) =
            store_error(FleetError::RateLimited { node_id: 1, count: 5 }.into());
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.code, "rate_limited");

        let (status, _) = store_error(FleetError::NotFound("node 9".to_string()).into());
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
