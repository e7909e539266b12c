//! Relay HTTP API.
//!
//! - POST /generate
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::RelayError;
use crate::genai::client::{build_request, GenerativeModel};
use crate::server::streaming::chunks_to_text_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub model: Arc<dyn GenerativeModel>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(model: Arc<dyn GenerativeModel>, config: Arc<Config>) -> Self {
        Self {
            model,
            config,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub uptime_secs: u64,
}

/// Whether the request declares a JSON body (`application/json` or a
/// `+json` suffix type), ignoring parameters such as `charset`.
pub fn is_json_content_type(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let mime = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    mime == "application/json"
        || (mime.starts_with("application/") && mime.ends_with("+json"))
}

/// Extract the trimmed `query` from a raw `/generate` body.
pub fn parse_query(body: &[u8]) -> Result<String, RelayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidBody(format!("invalid JSON body: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(RelayError::InvalidBody(
            "request body must be a JSON object".to_string(),
        ));
    };

    match fields.get("query") {
        None => Err(RelayError::MissingQuery),
        Some(Value::String(query)) => {
            let query = query.trim();
            if query.is_empty() {
                Err(RelayError::MissingQuery)
            } else {
                Ok(query.to_string())
            }
        }
        Some(other) => Err(RelayError::InvalidBody(format!(
            "'query' must be a string, got {other}"
        ))),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, RelayError> {
    let request_id = Uuid::new_v4().to_string();
    if !is_json_content_type(&headers) {
        let found = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        return Err(RelayError::InvalidBody(format!(
            "unsupported media type: {found}; expected application/json"
        )));
    }
    let body =
        body.map_err(|e| RelayError::InvalidBody(format!("failed to read request body: {e}")))?;
    let query = parse_query(&body)?;

    info!(
        request_id,
        model = state.model.model_id(),
        query_chars = query.chars().count(),
        "Generate request"
    );

    let request = build_request(&query, &state.config.generation);
    let chunks = state.model.stream_generate(request).await?;
    let body = Body::from_stream(chunks_to_text_stream(chunks, request_id));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.model.model_id().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
