//! Transport-agnostic async JSON-RPC 2.0 client
//!
//! This module provides [`JsonRpcClient`], a channel-backed JSON-RPC 2.0
//! client that is completely decoupled from the underlying transport.
//! Callers wire up two channels (one for outbound serialized messages, one
//! for inbound serialized messages) and then call [`start_read_loop`] to
//! process responses concurrently.
//!
//! # Design
//!
//! - Outbound messages are written to `outbound_tx` as newline-free JSON
//!   strings. The transport layer is responsible for framing.
//! - In-flight requests are tracked in a `pending` map keyed by `u64`
//!   request ID. Each entry is a `oneshot::Sender` that receives the
//!   `result` or `error` value when the matching response arrives.
//! - Server-initiated requests and notifications are not handled here; the
//!   read loop posts them as [`SessionEvent`]s on a single inbox channel and
//!   the session owner reacts. The owner answers server requests through
//!   [`JsonRpcClient::respond`].
//! - A [`tokio_util::sync::CancellationToken`] stops the read loop cleanly
//!   and drops all pending senders so that awaiting callers receive
//!   `SessionClosed` instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{McpLensError, Result};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, NOTIF_CANCELLED};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// The pending-response map type: maps request ID to the oneshot sender.
type PendingMap =
    HashMap<u64, oneshot::Sender<std::result::Result<serde_json::Value, JsonRpcError>>>;

/// A message the read loop posts to the session owner's inbox.
///
/// Responses to client-originated requests never appear here; they resolve
/// the matching pending waiter directly.
#[derive(Debug)]
pub enum SessionEvent {
    /// A server-sent notification (a frame with `method` but no `id`).
    Notification {
        /// The notification method name.
        method: String,
        /// The raw `params` value (`Null` when absent).
        params: serde_json::Value,
    },
    /// A server-initiated request (a frame with both `method` and `id`).
    ///
    /// The receiver must eventually answer via [`JsonRpcClient::respond`] or
    /// [`JsonRpcClient::respond_error`].
    ServerRequest {
        /// The server's request id, echoed back in the response.
        id: serde_json::Value,
        /// The request method name.
        method: String,
        /// The raw `params` value (`Null` when absent).
        params: serde_json::Value,
    },
    /// The read loop has exited: the transport closed, the loop was
    /// cancelled, or the peer violated framing. All pending waiters have
    /// been dropped.
    Closed {
        /// Human-readable reason, surfaced as the record's `lastError`.
        reason: String,
    },
}

/// Transport-agnostic async JSON-RPC 2.0 client.
///
/// Create one with [`JsonRpcClient::new`], wrap it in an `Arc`, and pass a
/// clone to [`start_read_loop`]. Issue requests with
/// [`JsonRpcClient::request`] and fire-and-forget notifications with
/// [`JsonRpcClient::notify`].
pub struct JsonRpcClient {
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    /// In-flight requests waiting for a response.
    pending: Mutex<PendingMap>,
    /// Channel used to send serialized JSON-RPC messages to the transport.
    outbound_tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Create a new `JsonRpcClient` writing serialized frames to `outbound_tx`.
    ///
    /// The caller is responsible for wiring the receiver half to a transport
    /// writer and for calling [`start_read_loop`] with the corresponding
    /// inbound receiver.
    pub fn new(outbound_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
        }
    }

    /// Send a JSON-RPC request and await the typed response.
    ///
    /// Assigns the next monotonic ID, serializes the request, sends it on
    /// the outbound channel, and waits for the matching response.
    ///
    /// On timeout, the pending slot is removed and a
    /// `notifications/cancelled` notification is sent to the peer so it can
    /// stop working on the request.
    ///
    /// # Errors
    ///
    /// - [`McpLensError::Transport`] if the outbound channel is closed.
    /// - [`McpLensError::Timeout`] if no response arrives within `timeout`.
    /// - [`McpLensError::SessionClosed`] if the read loop exits first.
    /// - [`McpLensError::Rpc`] if the server returns an error response.
    /// - [`McpLensError::Serialization`] on (de)serialization failure.
    pub async fn request<P, R>(&self, method: &str, params: P, timeout: Option<Duration>) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register the pending slot before sending so the response can never
        // arrive before we are ready to receive it.
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let message = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params: Some(serde_json::to_value(params)?),
        })?;

        if self.outbound_tx.send(message).is_err() {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(McpLensError::Transport("outbound channel closed".to_string()).into());
        }

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Release the slot and tell the peer to stop working.
                {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&id);
                }
                let _ = self.notify(
                    NOTIF_CANCELLED,
                    serde_json::json!({ "requestId": id, "reason": "timeout" }),
                );
                return Err(McpLensError::Timeout {
                    server: "(unknown)".to_string(),
                    operation: method.to_string(),
                }
                .into());
            }
        };

        // The oneshot was dropped: the read loop exited before a response arrived.
        let rpc_result = outcome.map_err(|_| {
            McpLensError::SessionClosed(format!("session closed awaiting {method}"))
        })?;

        let value = rpc_result.map_err(|e| McpLensError::Rpc {
            code: e.code,
            message: e.message,
        })?;

        serde_json::from_value(value).map_err(|e| McpLensError::Serialization(e).into())
    }

    /// Send a JSON-RPC notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the outbound channel is closed
    /// and [`McpLensError::Serialization`] if serialization fails.
    pub fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let message = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": serde_json::to_value(params)?
        }))?;

        self.outbound_tx
            .send(message)
            .map_err(|_| McpLensError::Transport("outbound channel closed".to_string()))?;

        Ok(())
    }

    /// Answer a server-initiated request with a successful result.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the outbound channel is closed.
    pub fn respond(&self, id: serde_json::Value, result: serde_json::Value) -> Result<()> {
        self.send_response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        })
    }

    /// Answer a server-initiated request with a JSON-RPC error.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the outbound channel is closed.
    pub fn respond_error(&self, id: serde_json::Value, code: i64, message: &str) -> Result<()> {
        self.send_response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        })
    }

    fn send_response(&self, response: JsonRpcResponse) -> Result<()> {
        let serialized = serde_json::to_string(&response)?;
        self.outbound_tx
            .send(serialized)
            .map_err(|_| McpLensError::Transport("outbound channel closed".to_string()))?;
        Ok(())
    }

    /// Number of requests currently awaiting a response. Test hook.
    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Start the JSON-RPC read loop as a background Tokio task.
///
/// The loop reads serialized JSON strings from `inbound_rx`, classifies each
/// message, and dispatches it:
///
/// - **Response** (has `"id"` and `"result"` or `"error"`): resolves the
///   matching pending [`oneshot`] sender. Responses with no matching pending
///   request are logged at debug level and dropped.
/// - **Server-initiated request** (has `"id"` and `"method"`): posted to the
///   inbox as [`SessionEvent::ServerRequest`].
/// - **Notification** (has `"method"` but no `"id"`): posted to the inbox as
///   [`SessionEvent::Notification`].
///
/// A frame that is not valid JSON is a protocol violation by the peer: the
/// loop posts [`SessionEvent::Closed`] and exits, failing the session.
///
/// On any exit path, all pending senders are dropped so that in-flight
/// `request()` calls fail with `SessionClosed` rather than blocking, and a
/// final `Closed` event is posted to the inbox.
pub fn start_read_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<String>,
    cancellation: CancellationToken,
    client: Arc<JsonRpcClient>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    break "session cancelled".to_string();
                }

                maybe_msg = inbound_rx.recv() => {
                    let raw = match maybe_msg {
                        Some(s) => s,
                        None => break "transport closed".to_string(),
                    };

                    match dispatch_message(&raw, &client, &events).await {
                        Ok(()) => {}
                        Err(reason) => break reason,
                    }
                }
            }
        };

        // Drop all pending senders so that callers receive SessionClosed
        // instead of waiting forever.
        {
            let mut pending = client.pending.lock().await;
            pending.clear();
        }
        let _ = events.send(SessionEvent::Closed { reason });
    })
}

/// Classify and dispatch a single inbound JSON string.
///
/// Returns `Err(reason)` when the frame is a protocol violation that must
/// fail the session.
async fn dispatch_message(
    raw: &str,
    client: &Arc<JsonRpcClient>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> std::result::Result<(), String> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("read loop: inbound frame is not valid JSON: {e}");
            return Err(format!("peer sent undecodable frame: {e}"));
        }
    };

    let has_id = value.get("id").is_some() && !value["id"].is_null();
    let has_method = value.get("method").is_some();
    let has_result = value.get("result").is_some();
    let has_error = value.get("error").is_some();

    if has_id && (has_result || has_error) && !has_method {
        handle_response(value, client).await;
    } else if has_id && has_method {
        let method = value["method"].as_str().unwrap_or_default().to_string();
        let _ = events.send(SessionEvent::ServerRequest {
            id: value["id"].clone(),
            method,
            params: value.get("params").cloned().unwrap_or(serde_json::Value::Null),
        });
    } else if has_method && !has_id {
        let method = value["method"].as_str().unwrap_or_default().to_string();
        let _ = events.send(SessionEvent::Notification {
            method,
            params: value.get("params").cloned().unwrap_or(serde_json::Value::Null),
        });
    } else {
        tracing::debug!(
            "read loop: unclassifiable message ignored; \
             has_id={has_id} has_method={has_method} has_result={has_result} has_error={has_error}"
        );
    }
    Ok(())
}

/// Resolve a pending request sender with the response value or error.
async fn handle_response(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let id_val = &value["id"];
    let id: u64 = if let Some(n) = id_val.as_u64() {
        n
    } else if let Some(s) = id_val.as_str() {
        match s.parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!("read loop: response has non-integer id: {id_val}");
                return;
            }
        }
    } else {
        tracing::warn!("read loop: response has non-integer id: {id_val}");
        return;
    };

    let tx = {
        let mut pending = client.pending.lock().await;
        pending.remove(&id)
    };

    let Some(tx) = tx else {
        tracing::debug!("read loop: response for unknown id {id}; dropped");
        return;
    };

    let outcome: std::result::Result<serde_json::Value, JsonRpcError> =
        if let Some(error_val) = value.get("error") {
            match serde_json::from_value::<JsonRpcError>(error_val.clone()) {
                Ok(e) => Err(e),
                Err(_) => Err(JsonRpcError {
                    code: -32603,
                    message: format!("malformed error object: {error_val}"),
                    data: None,
                }),
            }
        } else {
            Ok(value
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null))
        };

    // Ignore send errors: the caller may have already timed out.
    let _ = tx.send(outcome);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
