//! Public data endpoint for PULL transfers.
//!
//! A consumer presents the token from its endpoint data reference and gets
//! the bytes of one part of the flow's source, streamed as they are read.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ferry_core::FailureReason;
use ferry_manager::AuthorizationError;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::json_error;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct PublicParams {
    /// Part to fetch; the first part of the source when absent.
    part: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn authorization_error(err: &AuthorizationError) -> Response {
    let status = match err {
        AuthorizationError::Revoked { .. } | AuthorizationError::Expired { .. } => {
            StatusCode::FORBIDDEN
        }
        AuthorizationError::Key(_) | AuthorizationError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::UNAUTHORIZED,
    };
    json_error(status, &err.to_string())
}

/// GET /public?part=
pub(crate) async fn handle_public(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PublicParams>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return json_error(StatusCode::UNAUTHORIZED, "bearer token required");
    };
    let Some(auth) = state.manager.authorization() else {
        return json_error(StatusCode::NOT_FOUND, "public endpoint disabled");
    };
    let access = match auth.authorize(token).await {
        Ok(access) => access,
        Err(e) => {
            debug!(error = %e, "public request rejected");
            return authorization_error(&e);
        }
    };

    let mut source = match state.pipeline.open_source(&access.source).await {
        Ok(source) => source,
        Err(failure) => {
            warn!(flow_id = %access.flow_id, error = %failure, "cannot open source");
            let status = match failure.reason {
                FailureReason::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            return json_error(status, &failure.to_string());
        }
    };

    loop {
        let part = match source.next_part().await {
            Ok(Some(part)) => part,
            Ok(None) => {
                let message = match &params.part {
                    Some(name) => format!("no part named '{name}'"),
                    None => "source is empty".to_string(),
                };
                return json_error(StatusCode::NOT_FOUND, &message);
            }
            Err(failure) => {
                warn!(flow_id = %access.flow_id, error = %failure, "source read failed");
                return json_error(StatusCode::BAD_GATEWAY, &failure.to_string());
            }
        };
        if params.part.as_ref().is_some_and(|name| *name != part.name) {
            continue;
        }

        debug!(flow_id = %access.flow_id, part = %part.name, "serving part");
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        );
        if let Ok(value) = header::HeaderValue::from_str(&part.name) {
            response_headers.insert("x-ferry-part", value);
        }
        if let Some(size) = part.size {
            response_headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(size));
        }
        let body = Body::from_stream(ReaderStream::new(part.into_reader()));
        return (StatusCode::OK, response_headers, body).into_response();
    }
}
