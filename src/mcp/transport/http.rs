//! Streamable HTTP/SSE transport for MCP
//!
//! This module implements [`HttpTransport`], which speaks the Streamable
//! HTTP transport protocol. Every outbound JSON-RPC message is sent as an
//! HTTP POST. The server may reply with:
//!
//! - `application/json` -- a direct JSON response body
//! - `text/event-stream` -- an SSE stream carrying one or more JSON-RPC
//!   messages
//! - `202 Accepted` -- an acknowledgement with no body (used for
//!   notifications)
//!
//! An optional GET stream ([`HttpTransport::open_get_stream`]) allows the
//! server to push unsolicited messages via a long-lived SSE connection.
//!
//! # Session management
//!
//! After a successful `initialize` POST the server MAY return an
//! `MCP-Session-Id` response header. When present, this value is stored and
//! attached to every subsequent POST as `MCP-Session-Id: <id>`. If the
//! server returns `404` while a session is active the session is cleared and
//! the transport reports the session expired.
//!
//! # Close behaviour
//!
//! [`Transport::close`] (and, as a fallback, `Drop`) issues an HTTP DELETE
//! with the `MCP-Session-Id` header. This is spec-required session
//! termination and best-effort only.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, RwLock};

use crate::error::{McpLensError, Result};
use crate::mcp::transport::Transport;
use crate::mcp::types::LATEST_PROTOCOL_VERSION;

/// Streamable HTTP/SSE transport.
#[derive(Debug)]
pub struct HttpTransport {
    /// Underlying reqwest HTTP client.
    http_client: Arc<reqwest::Client>,
    /// MCP endpoint URL (POST target).
    endpoint: url::Url,
    /// Active session ID, populated after `initialize` succeeds.
    session_id: Arc<RwLock<Option<String>>>,
    /// Static extra headers merged into every request (e.g. Authorization).
    headers: HashMap<String, String>,
    /// Sender for inbound JSON-RPC message strings.
    response_tx: mpsc::UnboundedSender<String>,
    /// Shared receiver exposed via `receive()`.
    response_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Sender for transport-level error/diagnostic strings.
    error_tx: mpsc::UnboundedSender<String>,
    /// Shared receiver exposed via `receive_err()`.
    error_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Last SSE event ID, used for stream resumption via `Last-Event-ID`.
    last_event_id: Arc<RwLock<Option<String>>>,
}

impl HttpTransport {
    /// Construct a new [`HttpTransport`] targeting `endpoint`.
    ///
    /// The `headers` map is merged into every outbound request; callers
    /// inject bearer tokens here. The `timeout` applies to each individual
    /// HTTP request. No network I/O is performed at construction time.
    pub fn new(endpoint: url::Url, headers: HashMap<String, String>, timeout: Duration) -> Self {
        let http_client = Arc::new(
            reqwest::Client::builder()
                .timeout(timeout)
                .build()
                // Default reqwest client construction cannot fail unless TLS
                // initialisation fails, which is fatal on any supported platform.
                .expect("failed to build reqwest client"),
        );

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Self {
            http_client,
            endpoint,
            session_id: Arc::new(RwLock::new(None)),
            headers,
            response_tx,
            response_rx: Arc::new(tokio::sync::Mutex::new(response_rx)),
            error_tx,
            error_rx: Arc::new(tokio::sync::Mutex::new(error_rx)),
            last_event_id: Arc::new(RwLock::new(None)),
        }
    }

    /// Open a long-lived SSE GET stream to receive unsolicited server
    /// messages.
    ///
    /// Issues an HTTP GET to the endpoint with `Accept: text/event-stream`
    /// and all session headers, then spawns a background Tokio task running
    /// [`parse_sse_stream`]. Returns immediately after spawning.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the GET request itself fails
    /// before streaming begins. A `405 Method Not Allowed` is not an error:
    /// servers without a push channel are allowed to refuse the GET.
    pub async fn open_get_stream(&self) -> Result<()> {
        let mut req = self
            .http_client
            .get(self.endpoint.as_str())
            .header("Accept", "text/event-stream")
            .header("MCP-Protocol-Version", LATEST_PROTOCOL_VERSION);

        {
            let sid = self.session_id.read().await;
            if let Some(ref id) = *sid {
                req = req.header("MCP-Session-Id", id.as_str());
            }
        }
        {
            let lei = self.last_event_id.read().await;
            if let Some(ref id) = *lei {
                req = req.header("Last-Event-ID", id.as_str());
            }
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpLensError::Transport(format!("GET stream request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(
                McpLensError::Transport(format!("GET stream returned HTTP {}", status)).into(),
            );
        }

        let byte_stream = response.bytes_stream();
        let response_tx = self.response_tx.clone();
        let last_event_id = Arc::clone(&self.last_event_id);
        tokio::spawn(async move {
            parse_sse_stream(byte_stream, response_tx, last_event_id).await;
        });

        Ok(())
    }

    /// Build the DELETE request that terminates the server-side session.
    fn termination_parts(&self) -> Option<(String, HashMap<String, String>)> {
        let session_id = self.session_id.try_read().ok()?.clone()?;
        let mut headers = self.headers.clone();
        headers.insert("MCP-Session-Id".to_string(), session_id);
        Some((self.endpoint.as_str().to_string(), headers))
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    /// Send a JSON-RPC message via HTTP POST to the MCP endpoint.
    ///
    /// Mandatory headers on every POST:
    ///
    /// - `Content-Type: application/json`
    /// - `Accept: application/json, text/event-stream`
    /// - `MCP-Protocol-Version`
    /// - `MCP-Session-Id: <id>` -- only when a session is active
    /// - `Last-Event-ID: <id>` -- only when reconnecting with a known event ID
    ///
    /// Response handling by `Content-Type`:
    ///
    /// - `application/json`: body read and pushed to `receive()`.
    /// - `text/event-stream`: SSE parsing task spawned; events pushed to
    ///   `receive()`.
    /// - `202 Accepted`: no-op (notification ACK).
    /// - `401 Unauthorized`: surfaced with the `WWW-Authenticate` value so
    ///   the manager can transition the record to `oauth-required`.
    /// - `404` (with active session): clears session and fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP request fails, the server returns `401`,
    /// or a `404` is received while a session is active.
    async fn send(&self, message: String) -> Result<()> {
        let mut req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", LATEST_PROTOCOL_VERSION)
            .body(message);

        {
            let sid = self.session_id.read().await;
            if let Some(ref id) = *sid {
                req = req.header("MCP-Session-Id", id.as_str());
            }
        }
        {
            let lei = self.last_event_id.read().await;
            if let Some(ref id) = *lei {
                req = req.header("Last-Event-ID", id.as_str());
            }
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpLensError::Transport(format!("HTTP POST failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(McpLensError::Unauthorized(format!(
                "MCP server returned 401; WWW-Authenticate: {www_auth}"
            ))
            .into());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let had_session = {
                let mut sid = self.session_id.write().await;
                sid.take().is_some()
            };
            if had_session {
                return Err(McpLensError::Transport("mcp session expired".into()).into());
            }
            return Err(McpLensError::Transport("HTTP 404 Not Found".into()).into());
        }

        // 202 Accepted = notification acknowledgement, no body expected.
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        if !status.is_success() {
            let _ = self
                .error_tx
                .send(format!("HTTP POST returned status {}", status));
            return Err(
                McpLensError::Transport(format!("HTTP POST returned status {}", status)).into(),
            );
        }

        // Capture the session ID handed out on the initialize response.
        if let Some(new_session_id) = response
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            let mut sid = self.session_id.write().await;
            if sid.is_none() {
                *sid = Some(new_session_id);
            }
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let response_tx = self.response_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            tokio::spawn(async move {
                parse_sse_stream(byte_stream, response_tx, last_event_id).await;
            });
        } else {
            let body = response.text().await.map_err(|e| {
                McpLensError::Transport(format!("failed to read response body: {}", e))
            })?;
            if !body.is_empty() {
                let _ = self.response_tx.send(body);
            }
        }

        Ok(())
    }

    /// Returns a stream of inbound JSON-RPC message strings.
    ///
    /// Messages are delivered in the order they are received, whether from
    /// direct JSON responses or SSE events.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.response_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Returns a stream of transport-level diagnostic / error strings.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.error_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Establish the long-lived SSE GET stream for server-initiated
    /// messages.
    async fn open_push_stream(&self) -> Result<()> {
        self.open_get_stream().await
    }

    /// Terminate the server-side session with an HTTP DELETE.
    ///
    /// Idempotent: the session id is taken on the first call, so subsequent
    /// calls are no-ops. Failures are ignored because the session is being
    /// torn down anyway.
    async fn close(&self) {
        let (endpoint, headers) = {
            let mut sid = self.session_id.write().await;
            match sid.take() {
                Some(id) => {
                    let mut headers = self.headers.clone();
                    headers.insert("MCP-Session-Id".to_string(), id);
                    (self.endpoint.as_str().to_string(), headers)
                }
                None => return,
            }
        };

        let mut req = self.http_client.delete(&endpoint);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let _ = req.send().await;
    }
}

impl Drop for HttpTransport {
    /// Fallback session termination for transports dropped without `close()`.
    ///
    /// A `reqwest::blocking::Client` on a throwaway thread sends the DELETE;
    /// `drop` cannot await and must not block the async runtime.
    fn drop(&mut self) {
        let Some((endpoint, headers)) = self.termination_parts() else {
            return;
        };

        let _ = std::thread::spawn(move || {
            if let Ok(client) = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
            {
                let mut req = client.delete(&endpoint);
                for (k, v) in &headers {
                    req = req.header(k.as_str(), v.as_str());
                }
                let _ = req.send();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// Parse an SSE byte stream and forward complete `data:` events to
/// `response_tx`.
///
/// Intended to run inside a `tokio::spawn`; consumes the stream until it
/// ends or an error occurs.
///
/// SSE field processing:
///
/// - `id:` -- stored in `last_event_id` for subsequent reconnect headers.
/// - `data: [PING]` (case-insensitive) or `event: ping` -- silently
///   discarded.
/// - All other `data:` values -- pushed to `response_tx`.
/// - `retry:` -- parsed but unused (reconnect is the manager's
///   responsibility).
pub async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    response_tx: mpsc::UnboundedSender<String>,
    last_event_id: Arc<RwLock<Option<String>>>,
) {
    use futures::StreamExt;

    // Buffer accumulates raw bytes between `\n\n` boundaries.
    let mut buffer = String::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(_) => break,
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(s) => s.to_string(),
            Err(_) => continue,
        };

        buffer.push_str(&text);

        // SSE events are separated by blank lines (`\n\n`).
        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            process_sse_event(&event_block, &response_tx, &last_event_id).await;
        }
    }

    // Process any remaining partial event in the buffer.
    if !buffer.is_empty() {
        process_sse_event(&buffer, &response_tx, &last_event_id).await;
    }
}

/// Process a single SSE event block (the text between two `\n\n` delimiters).
async fn process_sse_event(
    event_block: &str,
    response_tx: &mpsc::UnboundedSender<String>,
    last_event_id: &Arc<RwLock<Option<String>>>,
) {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
        // `retry:` and `:`-comment lines are ignored.
    }

    if let Some(id) = event_id {
        let mut guard = last_event_id.write().await;
        *guard = Some(id.to_string());
    }

    if let Some(et) = event_type {
        if et.eq_ignore_ascii_case("ping") {
            return;
        }
    }

    let data = data_lines.join("\n");
    if data.eq_ignore_ascii_case("[ping]") || data.is_empty() {
        return;
    }

    let _ = response_tx.send(data);
}
