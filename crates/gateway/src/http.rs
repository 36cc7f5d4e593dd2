//! HTTP facade
//!
//! # Endpoints
//!
//! - `GET /api/tools` - the worker's tool catalogue
//! - `POST /api/call-tool` - body `{"tool": <name>, "arguments": {..}}`
//! - `GET /health` - 200 while the worker is healthy, 503 otherwise
//! - `GET /metrics` - Prometheus text exposition (404 when disabled)
//!
//! Anything else falls through to the static UI directory when one is
//! configured, with `index.html` as the fallback document.
//!
//! Errors are returned as `{"error": {"code": <i64>, "message": <string>}}`.

use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use toolgate_common::{ToolgateError, METRICS};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::tool_client::ToolClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    tools: ToolClient,
    enable_metrics: bool,
}

impl AppState {
    pub fn new(tools: ToolClient, enable_metrics: bool) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                tools,
                enable_metrics,
            }),
        }
    }

    pub fn tools(&self) -> &ToolClient {
        &self.inner.tools
    }

    pub fn metrics_enabled(&self) -> bool {
        self.inner.enable_metrics
    }
}

/// Error returned by the API handlers
#[derive(Debug)]
pub struct ApiError(pub ToolgateError);

impl From<ToolgateError> for ApiError {
    fn from(err: ToolgateError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ToolgateError::invalid_input(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            warn!("Request failed ({}): {}", self.0.kind(), self.0);
        }

        // Worker errors carry their own message; everything else uses Display
        let message = match &self.0 {
            ToolgateError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Body of `POST /api/call-tool`
#[derive(Debug, Deserialize)]
pub struct CallToolRequest {
    pub tool: String,

    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    json!({})
}

/// Build the router with all endpoints
pub fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/api/tools", get(list_tools_handler))
        .route("/api/call-tool", post(call_tool_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => {
            let index = ServeFile::new(dir.join("index.html"));
            api.fallback_service(ServeDir::new(dir).fallback(index))
        }
        None => api,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn list_tools_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let result = state.tools().list_tools().await?;
    Ok(Json(result))
}

pub async fn call_tool_handler(
    State(state): State<AppState>,
    payload: Result<Json<CallToolRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let result = state
        .tools()
        .call_tool(&request.tool, request.arguments)
        .await?;
    Ok(Json(result))
}

/// Readiness of the tool worker
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let worker = state.tools().health();

    if worker.is_healthy() {
        (
            StatusCode::OK,
            Json(json!({"status": "healthy", "state": worker})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "state": worker})),
        )
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}
