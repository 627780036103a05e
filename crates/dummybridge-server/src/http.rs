//! HTTP request handlers
//!
//! Includes the rendezvous endpoints, the cookie helper and embedded page
//! serving.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dummybridge_auth::{available_flows, correlation_id, BrokerError, FlowInfo};
use dummybridge_core::LoginFields;
use dummybridge_web::Pages;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Login pages
        .route("/pages/*path", get(page_handler))
        // Rendezvous API
        .route("/wait/:id", post(wait_handler))
        .route("/submit/:id", post(submit_handler))
        // Cookie helper for the cookie extraction flow
        .route("/set_cookies", post(set_cookies_handler))
        // Server info
        .route("/flows", get(flows_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn empty_ok() -> Response {
    (StatusCode::OK, Json(serde_json::json!({}))).into_response()
}

/// Admission rejection and timeout share a status; the message tells them apart.
fn broker_status(err: BrokerError) -> StatusCode {
    match err {
        BrokerError::AdmissionRejected | BrokerError::Timeout => StatusCode::TOO_MANY_REQUESTS,
        BrokerError::AlreadyWaiting => StatusCode::CONFLICT,
        BrokerError::NotFound => StatusCode::NOT_FOUND,
        BrokerError::Cancelled => StatusCode::GONE,
    }
}

fn parse_fields(body: &[u8]) -> Option<LoginFields> {
    serde_json::from_slice(body).ok()
}

/// Coarse identity of the requester for admission control.
///
/// Prefers proxy headers, then the peer address. Spoofable; only used to
/// bound concurrent waits.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Rendezvous API Handlers
// ============================================================================

/// Wait for a submission tagged with `id`
///
/// Blocks up to the configured timeout. Responds with the submitted fields,
/// or 429 when the client has too many waits in flight or the wait timed out.
async fn wait_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let client = client_identity(&headers, peer.map(|ConnectInfo(addr)| addr));
    let id = correlation_id(&id);

    match state.broker.wait_for(&client, &id).await {
        Ok(fields) => (StatusCode::OK, Json(fields)).into_response(),
        Err(e) => {
            debug!("Wait for {} from {} failed: {}", id, client, e);
            error_response(broker_status(e), e.to_string())
        }
    }
}

/// Submit fields to the waiter registered under `id`
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(fields) = parse_fields(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
    };
    let id = correlation_id(&id);

    match state.broker.submit(&id, fields) {
        Ok(()) => empty_ok(),
        Err(e) => error_response(broker_status(e), e.to_string()),
    }
}

// ============================================================================
// Cookie Helper
// ============================================================================

fn valid_cookie_part(s: &str, is_name: bool) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_graphic() && !matches!(c, ';' | ',' | '"' | '\\') && !(is_name && c == '=')
        })
}

/// Set one cookie per submitted field
async fn set_cookies_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(cookies) = parse_fields(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
    };

    let max_age = state.config.cookie_max_age.as_secs();
    let mut headers = HeaderMap::new();
    for (name, value) in &cookies {
        if !valid_cookie_part(name, true) || !valid_cookie_part(value, false) {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid cookie {:?}", name));
        }
        let cookie = format!("{name}={value}; Max-Age={max_age}; Path=/; HttpOnly; Secure");
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid cookie {:?}", name))
            }
        }
    }

    info!("Setting {} cookies", cookies.len());
    (StatusCode::OK, headers, Json(serde_json::json!({}))).into_response()
}

// ============================================================================
// Pages
// ============================================================================

/// Serve embedded pages with proper content types
async fn page_handler(Path(path): Path<String>) -> Response {
    let path = path.trim_start_matches('/');

    debug!("Serving page: {}", path);

    match Pages::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();

            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime)],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

// ============================================================================
// Server Info
// ============================================================================

/// List the login flows the bridge offers
async fn flows_handler() -> Json<Vec<FlowInfo>> {
    Json(available_flows())
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
