//! `ferry serve` -- the data plane runtime plus its HTTP API.
//!
//! Starts the scheduler loop and exposes the signaling API the control plane
//! calls, as well as the public endpoint PULL consumers fetch data from.
//!
//! Endpoints:
//! - GET  /health                                - Runtime status
//! - POST /v1/dataflows                          - Start (or resume) a flow
//! - GET  /v1/dataflows?state=&limit=            - List flows
//! - GET  /v1/dataflows/{id}                     - Flow status
//! - POST /v1/dataflows/{id}/suspend             - Suspend a STARTED flow
//! - POST /v1/dataflows/{id}/terminate           - Terminate a flow
//! - POST /v1/dataflows/{id}/complete            - Complete a STARTED flow
//! - POST /v1/dataflows/{id}/resume              - Resume a SUSPENDED flow
//! - POST /v1/dataflows/{id}/provisioned         - Confirm a pending resource
//! - GET  /public?part=                          - PULL data, `Authorization: Bearer <token>`
//!
//! JSON responses use snake_case field names, matching the stored flow.

mod handlers;
mod public;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ferry_core::FerryConfig;
use ferry_manager::ManagerError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use self::handlers::{
    handle_complete, handle_get_flow, handle_health, handle_list_flows, handle_not_found,
    handle_provisioned, handle_resume, handle_start, handle_suspend, handle_terminate,
};
use self::public::handle_public;
use self::state::AppState;
use crate::runtime;

/// Maximum request body size: 1 MB. Start messages are small.
const MAX_BODY_SIZE: usize = 1024 * 1024;

static START_SCHEMA_STR: &str = include_str!("../../../../docs/dataflow-start-schema.json");

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

/// HTTP rendition of a signal or lookup failure.
fn manager_error(err: ManagerError) -> Response {
    let status = match &err {
        ManagerError::NotFound(_) | ManagerError::UnknownResource { .. } => StatusCode::NOT_FOUND,
        ManagerError::AlreadyExists(_) | ManagerError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        ManagerError::Flow(_) => StatusCode::BAD_REQUEST,
        ManagerError::Storage(e) if e.is_stale_write() => StatusCode::CONFLICT,
        ManagerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ManagerError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_error(status, &err.to_string())
}

/// Build the router over `state`.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/dataflows", post(handle_start).get(handle_list_flows))
        .route("/v1/dataflows/{id}", get(handle_get_flow))
        .route("/v1/dataflows/{id}/suspend", post(handle_suspend))
        .route("/v1/dataflows/{id}/terminate", post(handle_terminate))
        .route("/v1/dataflows/{id}/complete", post(handle_complete))
        .route("/v1/dataflows/{id}/resume", post(handle_resume))
        .route("/v1/dataflows/{id}/provisioned", post(handle_provisioned))
        .route("/public", get(handle_public))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Run the data plane until Ctrl+C.
pub async fn start_server(config: FerryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let schema: serde_json::Value = serde_json::from_str(START_SCHEMA_STR)?;
    let start_schema = jsonschema::validator_for(&schema)
        .map_err(|e| format!("internal error: failed to compile start schema: {e}"))?;

    let runtime = runtime::build(&config)?;
    runtime.manager.start().await?;
    let manager = runtime.manager.clone();

    let state = Arc::new(AppState {
        manager: runtime.manager,
        pipeline: runtime.pipeline,
        start_schema,
    });

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(runtime_id = %config.runtime_id, %addr, "ferry data plane listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await?;
    info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
