//! Server lifecycle routes
//!
//! `POST /servers` adds a record and immediately drives it to `ready`;
//! `DELETE /servers/{id}` removes it; `POST /servers/{id}/reconnect` tears
//! down and re-establishes the session. Ping and log-level are exposed per
//! server as well.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::manager::ServerSnapshot;
use crate::mcp::transport::ServerConfig;
use crate::mcp::types::LoggingLevel;
use crate::server::{ApiError, AppState};

/// Body of `POST /servers`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServerBody {
    /// Optional id; a fresh UUID is assigned when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Optional display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Transport configuration.
    pub config: ServerConfig,
    /// When `false`, the record is added without connecting. Default `true`.
    #[serde(default = "default_true")]
    pub connect: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /servers` — add a record and (by default) connect it.
///
/// Returns the record snapshot after the connection attempt; the connect
/// error, if any, is reflected in its `state`/`lastError` rather than
/// failing the add.
pub async fn add_server(
    State(state): State<AppState>,
    Json(body): Json<AddServerBody>,
) -> Result<Json<ServerSnapshot>, ApiError> {
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = body.name.unwrap_or_else(|| id.clone());

    state
        .manager
        .add_server(id.clone(), name, body.config)
        .await?;

    if body.connect {
        // A failed connect leaves the record in `failed`/`oauth-required`;
        // the caller reads the outcome from the snapshot.
        let _ = state.manager.connect(&id).await;
    }
    Ok(Json(state.manager.get_server(&id).await?))
}

/// `GET /servers` — snapshot every record.
pub async fn list_servers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServerSnapshot>>, ApiError> {
    Ok(Json(state.manager.list_servers().await))
}

/// `DELETE /servers/{id}` — disconnect and drop the record.
pub async fn remove_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.remove_server(&id).await?;
    Ok(Json(serde_json::json!({ "removed": id })))
}

/// `POST /servers/{id}/reconnect` — tear down and re-establish.
pub async fn reconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerSnapshot>, ApiError> {
    Ok(Json(state.manager.connect(&id).await?))
}

/// `POST /servers/{id}/disconnect` — close the session, keep the record.
pub async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerSnapshot>, ApiError> {
    Ok(Json(state.manager.disconnect(&id).await?))
}

/// `POST /servers/{id}/ping` — round-trip latency in milliseconds.
pub async fn ping(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let elapsed = state.manager.ping(&id).await?;
    Ok(Json(serde_json::json!({
        "serverId": id,
        "latencyMs": elapsed.as_millis() as u64,
    })))
}

/// Body of `POST /servers/{id}/log-level`.
#[derive(Debug, Deserialize)]
pub struct SetLogLevelBody {
    /// The minimum level the server should emit.
    pub level: LoggingLevel,
}

/// `POST /servers/{id}/log-level` — forward `logging/setLevel`.
pub async fn set_log_level(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetLogLevelBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.set_log_level(&id, body.level).await?;
    Ok(Json(serde_json::json!({ "serverId": id, "ok": true })))
}
