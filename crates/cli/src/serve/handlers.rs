//! Signaling and status handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ferry_core::{DataFlowStartMessage, DataFlowState, ProvisionedResource, FERRY_VERSION};
use serde::Deserialize;

use super::state::AppState;
use super::{json_error, manager_error};

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": FERRY_VERSION,
        "runtime_id": state.manager.runtime_id(),
    });
    (StatusCode::OK, Json(response))
}

/// Parse a JSON body, answering 400 on malformed input.
fn parse_json(body: &[u8]) -> Result<serde_json::Value, Response> {
    serde_json::from_slice(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")))
}

/// POST /v1/dataflows
///
/// Validates the body against the start message schema before touching the
/// store. Reusing the id of a SUSPENDED flow resumes it.
pub(crate) async fn handle_start(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let doc = match parse_json(&body) {
        Ok(doc) => doc,
        Err(response) => return response,
    };
    let errors: Vec<String> = state
        .start_schema
        .iter_errors(&doc)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        let body = serde_json::json!({
            "error": "invalid start message",
            "details": errors,
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    let message: DataFlowStartMessage = match serde_json::from_value(doc) {
        Ok(m) => m,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match state.manager.start_flow(message).await {
        Ok(flow) if flow.state == DataFlowState::Received => {
            (StatusCode::CREATED, Json(flow)).into_response()
        }
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    state: Option<String>,
    #[serde(default)]
    limit: usize,
}

/// GET /v1/dataflows?state=&limit=
pub(crate) async fn handle_list_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let filter = match params.state.as_deref().map(str::parse::<DataFlowState>) {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return json_error(StatusCode::BAD_REQUEST, &e),
    };
    match state.manager.list(filter, params.limit).await {
        Ok(flows) => {
            let body = serde_json::json!({ "count": flows.len(), "flows": flows });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => manager_error(e),
    }
}

/// GET /v1/dataflows/{id}
pub(crate) async fn handle_get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.status(&id).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SignalBody {
    reason: Option<String>,
}

/// Optional `{"reason": "..."}`; an empty body means no reason.
fn signal_reason(body: &[u8]) -> Result<Option<String>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let parsed: SignalBody = serde_json::from_slice(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")))?;
    Ok(parsed.reason)
}

/// POST /v1/dataflows/{id}/suspend
pub(crate) async fn handle_suspend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let reason = match signal_reason(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state.manager.suspend(&id, reason).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /v1/dataflows/{id}/terminate
pub(crate) async fn handle_terminate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let reason = match signal_reason(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state.manager.terminate(&id, reason).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /v1/dataflows/{id}/complete
pub(crate) async fn handle_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.complete(&id).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /v1/dataflows/{id}/resume
pub(crate) async fn handle_resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.resume(&id).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /v1/dataflows/{id}/provisioned
pub(crate) async fn handle_provisioned(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let resource: ProvisionedResource = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")),
    };
    if resource.flow_id != id {
        return json_error(
            StatusCode::BAD_REQUEST,
            &format!("resource belongs to flow '{}'", resource.flow_id),
        );
    }
    match state.manager.resource_provisioned(&id, resource).await {
        Ok(flow) => (StatusCode::OK, Json(flow)).into_response(),
        Err(e) => manager_error(e),
    }
}
