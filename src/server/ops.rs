//! Tool, resource, prompt, and elicitation-response routes
//!
//! All bodies name their target session by `serverId`; pagination cursors
//! pass through verbatim.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::mcp::protocol::ToolOutcome;
use crate::mcp::types::{ElicitationAction, TaskParams};
use crate::server::{ApiError, AppState};

/// Body of the paginated list routes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBody {
    /// Target server.
    pub server_id: String,
    /// Opaque cursor from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// `POST /tools/list`
pub async fn list_tools(
    State(state): State<AppState>,
    Json(body): Json<ListBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state.manager.list_tools(&body.server_id, body.cursor).await?;
    Ok(Json(serde_json::to_value(page).map_err(anyhow::Error::from)?))
}

/// Body of `POST /tools/execute`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteToolBody {
    /// Target server.
    pub server_id: String,
    /// Tool name as advertised by that server.
    pub tool_name: String,
    /// Arguments matching the tool's input schema.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Opt-in task wrapping.
    #[serde(default)]
    pub task_options: Option<TaskParams>,
}

/// `POST /tools/execute`
///
/// A task-result envelope is surfaced distinctly (`kind: "task"`) so the
/// caller can opt into polling; inline results come back as
/// `kind: "content"`.
pub async fn execute_tool(
    State(state): State<AppState>,
    Json(body): Json<ExecuteToolBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .manager
        .call_tool(
            &body.server_id,
            &body.tool_name,
            body.parameters,
            body.task_options,
            None,
            None,
        )
        .await?;

    let value = match outcome {
        ToolOutcome::Content(response) => serde_json::json!({
            "kind": "content",
            "result": response,
        }),
        ToolOutcome::Task(envelope) => serde_json::json!({
            "kind": "task",
            "task": envelope.task,
        }),
    };
    Ok(Json(value))
}

/// `POST /resources/list`
pub async fn list_resources(
    State(state): State<AppState>,
    Json(body): Json<ListBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .manager
        .list_resources(&body.server_id, body.cursor)
        .await?;
    Ok(Json(serde_json::to_value(page).map_err(anyhow::Error::from)?))
}

/// Body of `POST /resources/read`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceBody {
    /// Target server.
    pub server_id: String,
    /// Canonical resource URI.
    pub uri: String,
}

/// `POST /resources/read`
pub async fn read_resource(
    State(state): State<AppState>,
    Json(body): Json<ReadResourceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contents = state.manager.read_resource(&body.server_id, &body.uri).await?;
    Ok(Json(serde_json::json!({ "contents": contents })))
}

/// `POST /prompts/list`
pub async fn list_prompts(
    State(state): State<AppState>,
    Json(body): Json<ListBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .manager
        .list_prompts(&body.server_id, body.cursor)
        .await?;
    Ok(Json(serde_json::to_value(page).map_err(anyhow::Error::from)?))
}

/// Body of `POST /prompts/get`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptBody {
    /// Target server.
    pub server_id: String,
    /// Prompt name.
    pub name: String,
    /// Template argument substitutions.
    #[serde(default)]
    pub arguments: Option<HashMap<String, String>>,
}

/// `POST /prompts/get`
pub async fn get_prompt(
    State(state): State<AppState>,
    Json(body): Json<GetPromptBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rendered = state
        .manager
        .get_prompt(&body.server_id, &body.name, body.arguments)
        .await?;
    Ok(Json(serde_json::to_value(rendered).map_err(anyhow::Error::from)?))
}

/// Body of `POST /elicitation/respond`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationRespondBody {
    /// The open record's id from the `elicitation-open` event.
    pub request_id: String,
    /// `accept`, `decline`, or `cancel`.
    pub action: ElicitationAction,
    /// Structured content for `accept`.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

/// `POST /elicitation/respond`
///
/// Resolves the waiting tool call exactly once; duplicate or late responses
/// fail with `NOT_FOUND`.
pub async fn respond_elicitation(
    State(state): State<AppState>,
    Json(body): Json<ElicitationRespondBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .manager
        .elicitation()
        .respond(&body.request_id, body.action, body.content)
        .await?;
    Ok(Json(serde_json::json!({ "requestId": body.request_id, "ok": true })))
}
