//! OAuth proxy routes
//!
//! Browser UIs run OAuth authorization-code flows against remote MCP
//! servers but cannot always reach the token or dynamic-registration
//! endpoints directly (CORS). The edge brokers those calls:
//!
//! - `GET /oauth/metadata?url=` fetches an authorization-server or
//!   protected-resource metadata document.
//! - `POST /oauth/proxy` forwards a token-exchange or registration request
//!   and returns `{status, statusText, headers, body}`.
//!
//! URL policy: `http` and `https` only, and `https` exclusively in web
//! mode. Violations fail `VALIDATION_ERROR` before any outbound I/O.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::ErrorCode;
use crate::server::{ApiError, AppState};

/// Validate the target URL against the scheme policy.
fn validate_target(raw: &str, web_mode: bool) -> Result<url::Url, ApiError> {
    let url = url::Url::parse(raw)
        .map_err(|e| ApiError::validation(format!("invalid target URL `{raw}`: {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if !web_mode => Ok(url),
        "http" => Err(ApiError::validation(
            "plain http targets are disallowed in web mode",
        )),
        other => Err(ApiError::validation(format!(
            "unsupported target scheme `{other}`"
        ))),
    }
}

/// Query of `GET /oauth/metadata`.
#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    /// The metadata document URL.
    pub url: String,
}

/// `GET /oauth/metadata?url=` — fetch and return the metadata JSON.
pub async fn metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = validate_target(&query.url, state.settings.web_mode)?;

    let response = state
        .proxy_client
        .get(target)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| ApiError {
            code: ErrorCode::ServerUnreachable,
            message: format!("metadata fetch failed: {e}"),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError {
            code: ErrorCode::ServerUnreachable,
            message: format!("metadata fetch returned HTTP {status}"),
        });
    }

    let document: serde_json::Value = response.json().await.map_err(|e| {
        ApiError::validation(format!("metadata document is not JSON: {e}"))
    })?;
    Ok(Json(document))
}

/// Body of `POST /oauth/proxy`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyBody {
    /// Target URL.
    pub url: String,
    /// HTTP method; defaults to POST.
    #[serde(default = "default_method")]
    pub method: String,
    /// Headers forwarded upstream. `Content-Type` selects the encoding.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body object.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Flatten a JSON object into form fields.
///
/// String values pass through unquoted; other scalars use their JSON
/// spelling.
fn form_fields(body: &serde_json::Value) -> Result<Vec<(String, String)>, ApiError> {
    let object = body.as_object().ok_or_else(|| {
        ApiError::validation("form-encoded proxy bodies must be JSON objects")
    })?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect())
}

/// `POST /oauth/proxy` — forward the request and normalize the response.
pub async fn proxy(
    State(state): State<AppState>,
    Json(body): Json<ProxyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = validate_target(&body.url, state.settings.web_mode)?;

    let method: reqwest::Method = body
        .method
        .to_uppercase()
        .parse()
        .map_err(|_| ApiError::validation(format!("unsupported method `{}`", body.method)))?;
    let allowed = [
        reqwest::Method::GET,
        reqwest::Method::POST,
        reqwest::Method::PUT,
        reqwest::Method::DELETE,
        reqwest::Method::PATCH,
    ];
    if !allowed.contains(&method) {
        return Err(ApiError::validation(format!(
            "unsupported method `{}`",
            body.method
        )));
    }

    let content_type = body
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.to_ascii_lowercase())
        .unwrap_or_else(|| "application/json".to_string());

    let mut request = state.proxy_client.request(method, target);
    for (k, v) in &body.headers {
        // The encoder below sets Content-Type itself.
        if k.eq_ignore_ascii_case("content-type") {
            continue;
        }
        request = request.header(k.as_str(), v.as_str());
    }

    if let Some(payload) = &body.body {
        if content_type.starts_with("application/x-www-form-urlencoded") {
            request = request.form(&form_fields(payload)?);
        } else if content_type.starts_with("application/json") {
            request = request.json(payload);
        } else {
            return Err(ApiError::validation(format!(
                "unsupported content type `{content_type}`"
            )));
        }
    }

    let response = request.send().await.map_err(|e| ApiError {
        code: ErrorCode::ServerUnreachable,
        message: format!("proxy request failed: {e}"),
    })?;

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let raw = response.text().await.unwrap_or_default();
    let parsed_body = serde_json::from_str::<serde_json::Value>(&raw)
        .unwrap_or(serde_json::Value::String(raw));

    Ok(Json(serde_json::json!({
        "status": status.as_u16(),
        "statusText": status_text,
        "headers": headers,
        "body": parsed_body,
    })))
}
