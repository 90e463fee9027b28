//! HTTP edge: routes, SSE streams, and the OAuth proxy
//!
//! Adapts HTTP requests to core operations on the manager, hub, broker, and
//! chat engine. Errors are normalized to the `{code, message}` taxonomy;
//! SSE endpoints subscribe to the hub and stream `data: <json>` frames with
//! an initial `retry:` hint and periodic comment keep-alives.

pub mod chat;
pub mod oauth;
pub mod ops;
pub mod servers;
pub mod streams;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::chat::ChatEngine;
use crate::config::Settings;
use crate::error::{code_of, ErrorCode};
use crate::hub::EventHub;
use crate::manager::ClientManager;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    /// The client manager.
    pub manager: Arc<ClientManager>,
    /// The event hub SSE endpoints subscribe to.
    pub hub: Arc<EventHub>,
    /// The chat engine.
    pub engine: Arc<ChatEngine>,
    /// Ambient settings.
    pub settings: Settings,
    /// HTTP client used by the OAuth proxy, with the fixed User-Agent.
    pub proxy_client: reqwest::Client,
}

impl AppState {
    /// Assemble the state from the core singletons.
    pub fn new(manager: Arc<ClientManager>, engine: Arc<ChatEngine>, settings: Settings) -> Self {
        let hub = Arc::clone(manager.hub());
        let proxy_client = reqwest::Client::builder()
            .user_agent(concat!("mcplens/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build proxy HTTP client");
        Self {
            manager,
            hub,
            engine,
            settings,
            proxy_client,
        }
    }
}

/// The `{code, message}` error body every route returns on failure.
#[derive(Debug)]
pub struct ApiError {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: code_of(&err),
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
        }));
        (status, body).into_response()
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);
    let auth_token = state.settings.auth_token.clone();

    let router = Router::new()
        .route("/health", get(health))
        .route("/servers", post(servers::add_server).get(servers::list_servers))
        .route("/servers/:id", delete(servers::remove_server))
        .route("/servers/:id/reconnect", post(servers::reconnect))
        .route("/servers/:id/disconnect", post(servers::disconnect))
        .route("/servers/:id/ping", post(servers::ping))
        .route("/servers/:id/log-level", post(servers::set_log_level))
        .route("/tools/list", post(ops::list_tools))
        .route("/tools/execute", post(ops::execute_tool))
        .route("/resources/list", post(ops::list_resources))
        .route("/resources/read", post(ops::read_resource))
        .route("/prompts/list", post(ops::list_prompts))
        .route("/prompts/get", post(ops::get_prompt))
        .route("/elicitation/respond", post(ops::respond_elicitation))
        .route("/elicitation/stream", get(streams::elicitation_stream))
        .route("/rpc/stream", get(streams::rpc_stream))
        .route("/xray/stream", get(streams::xray_stream))
        .route("/chat", post(chat::chat))
        .route("/chat/approval", post(chat::respond_approval))
        .route("/oauth/proxy", post(oauth::proxy))
        .route("/oauth/metadata", get(oauth::metadata));

    router
        .layer(middleware::from_fn_with_state(
            auth_token,
            require_bearer,
        ))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Enforce `Authorization: Bearer <token>` when a token is configured.
///
/// `/health` stays open so orchestrators can probe liveness.
async fn require_bearer(
    State(token): State<Option<String>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = token else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        ApiError {
            code: ErrorCode::Unauthorized,
            message: "missing or invalid bearer token".to_string(),
        }
        .into_response()
    }
}

/// CORS from the `CORS_ORIGINS` allowlist; permissive when unset (local
/// development).
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}
